//! Core library for the Weather Information Protocol (WIP) fleet: the
//! packet codec, shared cache contract, configuration, and the four UDP
//! server loops. `src/main.rs` and `src/cli.rs` are thin wrappers around
//! what's exported here.

pub mod cache;
pub mod cli;
/// Configuration handling for the server fleet.
pub mod config;
pub mod codec;
pub mod error;
/// Logging setup shared by every binary entry point.
pub mod logging;
pub mod servers;

pub use error::WipError;

/// Internal limit of in-flight correlation entries kept by the Weather
/// server's routing map before new coordinate requests are rejected.
pub const MAX_IN_FLIGHT: usize = 512;

/// Maximum UDP payload accepted or emitted (spec §6).
pub const MAX_DATAGRAM_LEN: usize = codec::MAX_DATAGRAM_LEN;

/// Default UDP ports per role (spec §6).
pub const DEFAULT_PORT_LOCATION: u16 = 4109;
pub const DEFAULT_PORT_WEATHER: u16 = 4110;
pub const DEFAULT_PORT_QUERY: u16 = 4111;
pub const DEFAULT_PORT_REPORT: u16 = 4112;

/// Default deadline for the Weather→Location hop (spec §4.3).
pub const DEFAULT_LOCATION_TIMEOUT_MS: u64 = 2000;

/// Default allowed clock skew for authenticated packets (spec §4.2).
pub const DEFAULT_MAX_TIMESTAMP_SKEW_SECS: u64 = 300;

/// The four cooperating roles in the fleet (spec §2).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    enum_iterator::Sequence,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Weather,
    Location,
    Query,
    Report,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Weather => "weather",
            Role::Location => "location",
            Role::Query => "query",
            Role::Report => "report",
        }
    }

    /// The upper-snake form used in `WIP_AUTH_ENABLED_<ROLE>` /
    /// `WIP_PASSPHRASE_<ROLE>` environment variable names.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Role::Weather => "WEATHER",
            Role::Location => "LOCATION",
            Role::Query => "QUERY",
            Role::Report => "REPORT",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Role::Weather => DEFAULT_PORT_WEATHER,
            Role::Location => DEFAULT_PORT_LOCATION,
            Role::Query => DEFAULT_PORT_QUERY,
            Role::Report => DEFAULT_PORT_REPORT,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
