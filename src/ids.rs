//! ID and session-key helpers shared by every module.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate an 8-character random hex string, used for both agent and task ids.
pub fn random_hex_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Lowercase hex SHA-256 digest of `input`, used to derive the session file
/// name from a session key without ever writing raw terminal paths to disk.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
