//! Identifier and key helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32, e.g. `doc_1...`
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Joins key segments with a zero byte. Ids and codes never contain one, so a
/// prefix scan over `compound_key(&[a])` only matches keys under `a`.
pub fn compound_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Prefix that matches every compound key starting with `parts`.
pub fn key_prefix(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = compound_key(parts);
    key.push(0);
    key
}
