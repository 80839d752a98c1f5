//! HMAC-SHA256 request signing.
//!
//! The client proves possession of the shared secret by signing the string
//! `"{pid}:{timestamp}"`. The executable path is deliberately not covered; the
//! helper checks it separately against what the kernel reports for the PID.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::secret::SharedSecret;

type HmacSha256 = Hmac<Sha256>;

/// Current wall-clock time in Unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn keyed_mac(secret: &SharedSecret, pid: u32, timestamp: u64) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(format!("{pid}:{timestamp}").as_bytes());
    mac
}

/// Base64 signature over `"{pid}:{timestamp}"`
pub fn sign(pid: u32, timestamp: u64, secret: &SharedSecret) -> String {
    STANDARD.encode(keyed_mac(secret, pid, timestamp).finalize().into_bytes())
}

/// Checks freshness against the current clock, then the signature
pub fn validate(
    pid: u32,
    timestamp: u64,
    signature: &str,
    secret: &SharedSecret,
    max_age_secs: u64,
) -> bool {
    validate_at(pid, timestamp, signature, secret, max_age_secs, unix_now())
}

/// Same as [`validate`] with an explicit notion of "now".
///
/// Rejects timestamps more than `max_age_secs` away from `now` in either
/// direction. The signature comparison is constant-time.
pub fn validate_at(
    pid: u32,
    timestamp: u64,
    signature: &str,
    secret: &SharedSecret,
    max_age_secs: u64,
    now: u64,
) -> bool {
    if now.abs_diff(timestamp) > max_age_secs {
        tracing::debug!(pid, timestamp, now, "Rejecting stale authentication timestamp");
        return false;
    }

    let Ok(provided) = STANDARD.decode(signature) else {
        return false;
    };

    keyed_mac(secret, pid, timestamp)
        .verify_slice(&provided)
        .is_ok()
}
