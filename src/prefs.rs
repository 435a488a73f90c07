//! Namespaced client-side preferences stored in sled as CBOR
//!
//! Every value is optional. A missing or unreadable entry reads back as the
//! default, so a fresh or damaged store never blocks the session.
use super::fiat::FiatCode;
use super::types::{Address, Side};
use std::sync::Arc;

const FILTERS: &str = "filters";
const APPROVAL_MODE: &str = "approval-mode";
const REFERRER: &str = "referrer";

/// The market the user last browsed. `side` is the user-facing side.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct MarketFilters {
    #[n(0)]
    pub side: Side,
    #[n(1)]
    pub fiat: FiatCode,
    #[n(2)]
    pub token: Option<Address>,
}

impl Default for MarketFilters {
    fn default() -> Self {
        Self {
            side: Side::Buy,
            fiat: super::fiat::DEFAULT_FIAT,
            token: None,
        }
    }
}

/// How much token allowance to grant the ledger before funding a deal.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApprovalMode {
    #[n(0)]
    #[default]
    Exact,
    #[n(1)]
    Unlimited,
}

pub struct PreferenceStore {
    instance: Arc<sled::Db>,
    namespace: String,
}

impl PreferenceStore {
    pub fn new(instance: Arc<sled::Db>, namespace: impl Into<String>) -> Self {
        Self {
            instance,
            namespace: namespace.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }

    fn load<T>(&self, name: &str) -> Option<T>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let key = self.key(name);
        let bytes = match self.instance.get(key.as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(%key, error = %e, "preference unreadable, using default");
                return None;
            }
        };
        match minicbor::decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%key, error = %e, "preference corrupt, using default");
                None
            }
        }
    }

    fn save<T>(&self, name: &str, value: &T) -> anyhow::Result<()>
    where
        T: minicbor::Encode<()>,
    {
        let bytes = minicbor::to_vec(value)?;
        self.instance.insert(self.key(name).as_bytes(), bytes)?;
        Ok(())
    }

    pub fn filters(&self) -> MarketFilters {
        self.load(FILTERS).unwrap_or_default()
    }

    pub fn set_filters(&self, filters: &MarketFilters) -> anyhow::Result<()> {
        self.save(FILTERS, filters)
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.load(APPROVAL_MODE).unwrap_or_default()
    }

    pub fn set_approval_mode(&self, mode: ApprovalMode) -> anyhow::Result<()> {
        self.save(APPROVAL_MODE, &mode)
    }

    pub fn referrer(&self) -> Option<Address> {
        self.load(REFERRER)
    }

    pub fn set_referrer(&self, referrer: &Address) -> anyhow::Result<()> {
        self.save(REFERRER, referrer)
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        for name in [FILTERS, APPROVAL_MODE, REFERRER] {
            self.instance.remove(self.key(name).as_bytes())?;
        }
        Ok(())
    }
}

/// Stores the `ref` query parameter as the referrer when it is a well-formed
/// address. Anything else is ignored. Returns what was stored.
pub fn capture_referral(store: &PreferenceStore, query: &str) -> anyhow::Result<Option<Address>> {
    let query = query.trim_start_matches('?');
    let Some((_, value)) = url::form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == "ref")
    else {
        return Ok(None);
    };
    match Address::parse(&value) {
        Ok(referrer) if !referrer.is_zero() => {
            store.set_referrer(&referrer)?;
            tracing::debug!(%referrer, "referral captured");
            Ok(Some(referrer))
        }
        _ => {
            tracing::warn!(value = %value, "ignoring malformed referral");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> anyhow::Result<(tempfile::TempDir, PreferenceStore)> {
        let dir = tempdir()?;
        let db = sled::open(dir.path())?;
        Ok((dir, PreferenceStore::new(Arc::new(db), "escrow-market")))
    }

    #[test]
    fn empty_store_reads_defaults() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert_eq!(store.filters(), MarketFilters::default());
        assert_eq!(store.approval_mode(), ApprovalMode::Exact);
        assert_eq!(store.referrer(), None);
        Ok(())
    }

    #[test]
    fn corrupt_value_falls_back_to_default() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        store
            .instance
            .insert("escrow-market/approval-mode".as_bytes(), vec![0xff, 0x00])?;
        assert_eq!(store.approval_mode(), ApprovalMode::Exact);
        Ok(())
    }

    #[test]
    fn referral_requires_a_valid_address() -> anyhow::Result<()> {
        let (_dir, store) = store()?;
        assert_eq!(capture_referral(&store, "?ref=not-an-address")?, None);
        assert_eq!(store.referrer(), None);

        let good = "0x00000000000000000000000000000000000000Aa";
        let captured = capture_referral(&store, &format!("?utm=x&ref={good}"))?;
        assert_eq!(captured, Some(Address::parse(good)?));
        assert_eq!(store.referrer(), captured);
        Ok(())
    }
}
