//! Keyed-MAC packet authentication (spec §4.2).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WipError;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the auth_hash extended field (32-byte HMAC-SHA-256 digest).
pub const AUTH_HASH_LEN: usize = 32;

/// Builds the exact ASCII message the MAC is computed over:
/// `<packet_id>:<timestamp>:<passphrase>`, no trailing newline. Both the
/// message and the HMAC key are derived from `passphrase`; reproducing
/// this byte-for-byte is required for interop (spec §4.2).
fn message(packet_id: u16, timestamp: u64, passphrase: &str) -> String {
    format!("{packet_id}:{timestamp}:{passphrase}")
}

/// Computes the auth_hash a sender attaches to an outgoing packet.
pub fn compute(packet_id: u16, timestamp: u64, passphrase: &str) -> [u8; AUTH_HASH_LEN] {
    let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message(packet_id, timestamp, passphrase).as_bytes());
    mac.finalize().into_bytes().into()
}

/// Verifies a received auth_hash in constant time, and that `timestamp`
/// falls within `max_skew_secs` of `now`.
pub fn verify(
    packet_id: u16,
    timestamp: u64,
    now: u64,
    max_skew_secs: u64,
    passphrase: &str,
    received: &[u8; AUTH_HASH_LEN],
) -> Result<(), WipError> {
    let skew = timestamp.abs_diff(now);
    if skew > max_skew_secs {
        return Err(WipError::AuthFailure(format!(
            "timestamp skew {skew}s exceeds the allowed {max_skew_secs}s"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message(packet_id, timestamp, passphrase).as_bytes());
    mac.verify_slice(received)
        .map_err(|_| WipError::AuthFailure("MAC verification failed".to_string()))
}
