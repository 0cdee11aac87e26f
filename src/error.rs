use packed_struct::PackingError;
use std::str::Utf8Error;

/// When things go awry.
#[derive(Debug)]
pub enum WipError {
    /// Header shorter than 16 bytes, unknown type, or reserved bits set.
    MalformedHeader(String),
    /// The 12-bit header checksum failed verification.
    ChecksumMismatch,
    /// A declared extended-field record length ran past the packet bounds.
    ExtendedOverflow(String),
    /// `version` didn't match the implementation's supported version.
    UnsupportedVersion(u8),
    /// `type` wasn't one of the values the codec understands.
    UnknownPacketType(u8),
    /// A required extended field, or a required cache record, was missing.
    MissingRequiredData(String),
    /// MAC missing, invalid, or outside the allowed clock skew.
    AuthFailure(String),
    /// An upstream deadline expired before a matching reply arrived.
    Timeout,
    /// A field fell outside its documented legal range.
    InvalidValue(String),
    /// Something failed that doesn't fit any of the above.
    ServerError(String),
    IoError(std::io::Error),
    PackingError(String),
    Utf8Error(Utf8Error),
    Json(serde_json::Error),
    Config(config::ConfigError),
}

impl std::fmt::Display for WipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WipError::MalformedHeader(msg) => write!(f, "malformed header: {msg}"),
            WipError::ChecksumMismatch => write!(f, "checksum mismatch"),
            WipError::ExtendedOverflow(msg) => write!(f, "extended field overflow: {msg}"),
            WipError::UnsupportedVersion(v) => write!(f, "unsupported version: {v}"),
            WipError::UnknownPacketType(t) => write!(f, "unknown packet type: {t}"),
            WipError::MissingRequiredData(msg) => write!(f, "missing required data: {msg}"),
            WipError::AuthFailure(msg) => write!(f, "authentication failure: {msg}"),
            WipError::Timeout => write!(f, "timed out waiting for a reply"),
            WipError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
            WipError::ServerError(msg) => write!(f, "server error: {msg}"),
            WipError::IoError(err) => write!(f, "io error: {err}"),
            WipError::PackingError(msg) => write!(f, "packing error: {msg}"),
            WipError::Utf8Error(err) => write!(f, "utf8 error: {err}"),
            WipError::Json(err) => write!(f, "json error: {err}"),
            WipError::Config(err) => write!(f, "config error: {err}"),
        }
    }
}

impl std::error::Error for WipError {}

impl From<std::io::Error> for WipError {
    fn from(error: std::io::Error) -> Self {
        WipError::IoError(error)
    }
}

impl From<PackingError> for WipError {
    fn from(error: PackingError) -> Self {
        WipError::PackingError(error.to_string())
    }
}

impl From<Utf8Error> for WipError {
    fn from(error: Utf8Error) -> Self {
        WipError::Utf8Error(error)
    }
}

impl From<serde_json::Error> for WipError {
    fn from(error: serde_json::Error) -> Self {
        WipError::Json(error)
    }
}

impl From<config::ConfigError> for WipError {
    fn from(error: config::ConfigError) -> Self {
        WipError::Config(error)
    }
}

impl WipError {
    /// The §7 error-taxonomy code a peer should see for this failure.
    pub fn error_code(&self) -> u8 {
        match self {
            WipError::MalformedHeader(_) => 1,
            WipError::InvalidValue(_) => 1,
            WipError::ChecksumMismatch => 2,
            WipError::UnsupportedVersion(_) => 3,
            WipError::UnknownPacketType(_) => 4,
            WipError::MissingRequiredData(_) => 5,
            WipError::ExtendedOverflow(_) => 5,
            WipError::AuthFailure(_) => 6,
            WipError::Timeout => 7,
            WipError::ServerError(_)
            | WipError::IoError(_)
            | WipError::PackingError(_)
            | WipError::Utf8Error(_)
            | WipError::Json(_)
            | WipError::Config(_) => 8,
        }
    }
}
