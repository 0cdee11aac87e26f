use regex::Regex;
use std::sync::LazyLock;

/// Canonical textual area-code form used in config files, CLI arguments and
/// log lines. The wire format is a raw 20-bit integer; this only governs how
/// humans type one in.
pub static AREA_CODE_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,7}$").expect("Failed to parse an internal regex!"));

/// One line of an externally supplied weather-code table (`<code>,<label>`).
/// The code enumeration itself is opaque to the core (spec Open Question);
/// this only validates the file's line shape before a code is accepted.
pub static WEATHER_CODE_TABLE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<code>\d{1,5}),(?P<label>.+)$").expect("Failed to parse an internal regex!")
});

/// Matches the `<ROLE>` suffix of `WIP_AUTH_ENABLED_<ROLE>` / `WIP_PASSPHRASE_<ROLE>`.
pub static ROLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("Failed to parse an internal regex!"));
