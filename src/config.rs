use concread::cowcell::asynch::{CowCell, CowCellReadTxn};
use config::Config;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::Role;

static CONFIG_LOCATIONS: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| ["./wip.json", "~/.config/wip.json"].to_vec());

/// The main config blob for the WIP fleet. Write this as a JSON file (or
/// set the matching `WIP_*` environment variables) and every role reads
/// the fields it needs out of the same struct.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConfigFile {
    /// Used only for log lines and the `source` extended field's default.
    pub hostname: String,
    /// Bind address shared by all four UDP listeners.
    pub address: String,
    pub port_weather: u16,
    pub port_location: u16,
    pub port_query: u16,
    pub port_report: u16,
    /// Default is "info".
    pub log_level: String,
    /// Weather→Location hop deadline (spec §4.3).
    pub location_timeout_ms: u64,
    /// Weather→Query hop deadline; spec doesn't name this one explicitly
    /// but applies the same "every suspension point carries a deadline"
    /// rule (spec §5) symmetrically.
    pub query_timeout_ms: u64,
    /// Allowed clock skew for authenticated packets (spec §4.2).
    pub max_timestamp_skew_secs: u64,

    pub auth_enabled_weather: bool,
    pub auth_enabled_location: bool,
    pub auth_enabled_query: bool,
    pub auth_enabled_report: bool,

    #[serde(default, skip_serializing)]
    pub passphrase_weather: String,
    #[serde(default, skip_serializing)]
    pub passphrase_location: String,
    #[serde(default, skip_serializing)]
    pub passphrase_query: String,
    #[serde(default, skip_serializing)]
    pub passphrase_report: String,

    /// Optional JSON file the cache actor loads at startup and persists
    /// back to on shutdown. Without one, the cache starts empty and lives
    /// only in memory (spec §6 "cache connection parameters").
    pub cache_snapshot_path: Option<String>,
    /// Optional path to a `<code>,<label>` table used to validate
    /// Report's `weather_code` field (spec §4.6's "implementation-defined
    /// list loaded from a collaborator"). Without one, any `u16` is
    /// accepted.
    pub weather_code_table_path: Option<String>,
    /// Optional path to a JSON array of area bounding boxes used by the
    /// Location server to resolve (lat, lon) -> area_code (spec §4.4's
    /// "static spatial table supplied by an external collaborator").
    /// Without one, a small built-in fixture table is used.
    pub location_table_path: Option<String>,
}

impl ConfigFile {
    pub fn port_for(&self, role: Role) -> u16 {
        match role {
            Role::Weather => self.port_weather,
            Role::Location => self.port_location,
            Role::Query => self.port_query,
            Role::Report => self.port_report,
        }
    }

    pub fn auth_enabled_for(&self, role: Role) -> bool {
        match role {
            Role::Weather => self.auth_enabled_weather,
            Role::Location => self.auth_enabled_location,
            Role::Query => self.auth_enabled_query,
            Role::Report => self.auth_enabled_report,
        }
    }

    pub fn passphrase_for(&self, role: Role) -> &str {
        match role {
            Role::Weather => &self.passphrase_weather,
            Role::Location => &self.passphrase_location,
            Role::Query => &self.passphrase_query,
            Role::Report => &self.passphrase_report,
        }
    }

    pub fn listener_address(&self, role: Role) -> Result<SocketAddr, std::io::Error> {
        format!("{}:{}", self.address, self.port_for(role))
            .parse()
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, format!("{e}")))
    }

    pub fn as_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("ConfigFile always serializes")
    }

    /// Loads configuration from a given file or from the default
    /// locations, then layers `WIP_*` environment variables over the
    /// result (env wins).
    pub fn try_from(config_path: Option<&String>) -> Result<ConfigFile, std::io::Error> {
        let file_locations: Vec<String> = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(f).into_owned();
                match std::path::Path::new(&path).exists() {
                    true => Some(path),
                    false => {
                        eprintln!("Config file {path} doesn't exist, skipping.");
                        None
                    }
                }
            })
            .collect();

        let mut builder = Config::builder();
        for path in &found_files {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Json));
        }
        builder = builder.add_source(config::Environment::with_prefix("wip"));

        let config = builder.build().map_err(|e| {
            std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Couldn't load configuration: {e}"),
            )
        })?;

        Ok(ConfigFile::from(config))
    }

    /// Like [`Self::try_from`], wrapped in a `CowCell` so every role's
    /// handlers can take a lock-free read snapshot of config mid-request.
    pub fn try_as_cowcell(
        config_path: Option<&String>,
    ) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from(config_path)?))
    }

    pub async fn current(cowcell: &CowCell<ConfigFile>) -> CowCellReadTxn<ConfigFile> {
        cowcell.read().await
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        let hostname = gethostname().into_string().unwrap_or_default();
        Self {
            hostname,
            address: "127.0.0.1".to_string(),
            port_weather: crate::DEFAULT_PORT_WEATHER,
            port_location: crate::DEFAULT_PORT_LOCATION,
            port_query: crate::DEFAULT_PORT_QUERY,
            port_report: crate::DEFAULT_PORT_REPORT,
            log_level: "info".to_string(),
            location_timeout_ms: crate::DEFAULT_LOCATION_TIMEOUT_MS,
            query_timeout_ms: crate::DEFAULT_LOCATION_TIMEOUT_MS,
            max_timestamp_skew_secs: crate::DEFAULT_MAX_TIMESTAMP_SKEW_SECS,
            auth_enabled_weather: false,
            auth_enabled_location: false,
            auth_enabled_query: false,
            auth_enabled_report: false,
            passphrase_weather: String::new(),
            passphrase_location: String::new(),
            passphrase_query: String::new(),
            passphrase_report: String::new(),
            cache_snapshot_path: None,
            weather_code_table_path: None,
            location_table_path: None,
        }
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hostname=\"{}\" address={} ports=(weather={} location={} query={} report={}) \
             log_level={} auth=(weather={} location={} query={} report={})",
            self.hostname,
            self.address,
            self.port_weather,
            self.port_location,
            self.port_query,
            self.port_report,
            self.log_level,
            self.auth_enabled_weather,
            self.auth_enabled_location,
            self.auth_enabled_query,
            self.auth_enabled_report,
        )
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        let default = Self::default();
        ConfigFile {
            hostname: config.get("hostname").unwrap_or(default.hostname),
            address: config.get("address").unwrap_or(default.address),
            port_weather: config.get("port_weather").unwrap_or(default.port_weather),
            port_location: config
                .get("port_location")
                .unwrap_or(default.port_location),
            port_query: config.get("port_query").unwrap_or(default.port_query),
            port_report: config.get("port_report").unwrap_or(default.port_report),
            log_level: config.get("log_level").unwrap_or(default.log_level),
            location_timeout_ms: config
                .get("location_timeout_ms")
                .unwrap_or(default.location_timeout_ms),
            query_timeout_ms: config
                .get("query_timeout_ms")
                .unwrap_or(default.query_timeout_ms),
            max_timestamp_skew_secs: config
                .get("max_timestamp_skew_secs")
                .unwrap_or(default.max_timestamp_skew_secs),
            auth_enabled_weather: config
                .get("auth_enabled_weather")
                .unwrap_or(default.auth_enabled_weather),
            auth_enabled_location: config
                .get("auth_enabled_location")
                .unwrap_or(default.auth_enabled_location),
            auth_enabled_query: config
                .get("auth_enabled_query")
                .unwrap_or(default.auth_enabled_query),
            auth_enabled_report: config
                .get("auth_enabled_report")
                .unwrap_or(default.auth_enabled_report),
            passphrase_weather: config.get("passphrase_weather").unwrap_or_default(),
            passphrase_location: config.get("passphrase_location").unwrap_or_default(),
            passphrase_query: config.get("passphrase_query").unwrap_or_default(),
            passphrase_report: config.get("passphrase_report").unwrap_or_default(),
            cache_snapshot_path: config.get("cache_snapshot_path").ok(),
            weather_code_table_path: config.get("weather_code_table_path").ok(),
            location_table_path: config.get("location_table_path").ok(),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let file = config::File::from_str(input, config::FileFormat::Json);
        let config = Config::builder()
            .add_source(file)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(config.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let config = ConfigFile::default();
        assert_eq!(config.port_weather, 4110);
        assert_eq!(config.port_location, 4109);
        assert_eq!(config.port_query, 4111);
        assert_eq!(config.port_report, 4112);
        assert_eq!(config.max_timestamp_skew_secs, 300);
    }

    #[test]
    fn parses_a_minimal_json_document() {
        let json = r#"{"address": "0.0.0.0", "port_weather": 5000}"#;
        let config: ConfigFile = json.parse().expect("should parse");
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port_weather, 5000);
        // untouched fields keep their defaults
        assert_eq!(config.port_report, 4112);
    }

    #[test]
    fn per_role_accessors_match_the_named_fields() {
        let mut config = ConfigFile::default();
        config.passphrase_report = "hunter2".to_string();
        config.auth_enabled_report = true;
        assert_eq!(config.passphrase_for(Role::Report), "hunter2");
        assert!(config.auth_enabled_for(Role::Report));
        assert!(!config.auth_enabled_for(Role::Weather));
        assert_eq!(config.port_for(Role::Location), 4109);
    }
}
