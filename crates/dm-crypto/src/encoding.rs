//! Base64 (standard alphabet, padded) for key material and nonces on the wire.

use base64::{engine::general_purpose::STANDARD, Engine};
use dm_core::{DmError, DmResult};

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode `s`; `what` names the field in the error message.
pub fn decode(s: &str, what: &str) -> DmResult<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| DmError::InvalidInput(format!("{what}: invalid base64: {e}")))
}

/// Decode into a fixed-size array, rejecting any other length.
pub fn decode_array<const N: usize>(s: &str, what: &str) -> DmResult<[u8; N]> {
    let bytes = decode(s, what)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        DmError::InvalidInput(format!("{what}: expected {N} bytes, got {}", bytes.len()))
    })
}
