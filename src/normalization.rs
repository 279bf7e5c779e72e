// src/normalization.rs
//
// Address normalization: turns arbitrary user input into canonical pool addresses.
// Malformed entries are dropped and reported once; they never abort a fetch.

use ethers::types::Address;
use log::warn;

/// Number of hex digits in an address body.
const ADDRESS_HEX_LEN: usize = 40;

/// Result of normalizing a list of raw address strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedAddresses {
    /// `(original_index, address)` for every well-formed input, in input order.
    pub valid: Vec<(usize, Address)>,
    /// Raw inputs that were rejected, in input order.
    pub invalid: Vec<String>,
}

impl NormalizedAddresses {
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.valid.iter().map(|(_, addr)| *addr)
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}

/// Parse one address. Accepts an optional `0x`/`0X` prefix and any hex case.
/// Returns `None` for anything that is not exactly 40 hex digits.
pub fn normalize_address(raw: &str) -> Option<Address> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if body.len() != ADDRESS_HEX_LEN || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    let mut bytes = [0u8; 20];
    hex::decode_to_slice(body, &mut bytes).ok()?;
    Some(Address::from(bytes))
}

/// Normalize a list of inputs, keeping the original position of every valid address.
///
/// Invalid entries are collected and logged in a single warning.
pub fn normalize_addresses<S: AsRef<str>>(inputs: &[S]) -> NormalizedAddresses {
    let mut normalized = NormalizedAddresses::default();

    for (idx, raw) in inputs.iter().enumerate() {
        match normalize_address(raw.as_ref()) {
            Some(addr) => normalized.valid.push((idx, addr)),
            None => normalized.invalid.push(raw.as_ref().to_string()),
        }
    }

    if !normalized.invalid.is_empty() {
        warn!(
            "Dropped {} invalid address(es): {}",
            normalized.invalid.len(),
            normalized.invalid.join(", ")
        );
    }

    normalized
}

/// Canonical textual form: lowercase, `0x`-prefixed, 40 hex digits.
pub fn canonical(addr: &Address) -> String {
    format!("{:#x}", addr)
}
