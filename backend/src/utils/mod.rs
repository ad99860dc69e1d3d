//! # Utilities Module
//!
//! This module contains helper functions and utilities used
//! across the operator service.

pub mod json_rpc;

/// Normalize an account address for comparisons and storage.
///
/// Ledger accounts arrive checksummed from wallets and lowercase from
/// recovery. We store and compare the lowercase `0x`-prefixed form.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(normalize_address("0xAbC...")?, "0xabc...");
/// ```
pub fn normalize_address(address: &str) -> Result<String, String> {
    let stripped = strip_hex_prefix(address.trim());
    if stripped.len() != 40 {
        return Err(format!(
            "Invalid address length: {} (expected 40 hex characters)",
            stripped.len()
        ));
    }
    if !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid character in address: {}", address));
    }
    Ok(format!("0x{}", stripped.to_ascii_lowercase()))
}

/// Decode an address into its 20 raw bytes.
pub fn address_bytes(address: &str) -> Result<[u8; 20], String> {
    let normalized = normalize_address(address)?;
    let bytes = decode_hex(&normalized)?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Decode a hex string, with or without `0x` prefix.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, String> {
    hex::decode(strip_hex_prefix(value.trim())).map_err(|e| format!("Invalid hex {}: {}", value, e))
}

/// Encode bytes as a `0x`-prefixed hex string.
pub fn encode_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Remove a leading `0x` if present.
fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}
