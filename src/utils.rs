//! Placeholder identifiers for entries the ledger has not confirmed yet

use bech32::Bech32m;
use uuid7::uuid7;

pub const DRAFT_HRP: &str = "draft";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// A fresh draft id. Falls back to the raw uuid if bech32 encoding fails.
pub fn draft_id() -> String {
    new_uuid_to_bech32(DRAFT_HRP).unwrap_or_else(|_| format!("{DRAFT_HRP}_{}", uuid7()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_ids_are_unique_and_prefixed() {
        let a = draft_id();
        let b = draft_id();
        assert!(a.starts_with("draft1"));
        assert_ne!(a, b);
    }
}
