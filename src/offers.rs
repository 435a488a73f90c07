//! Offer cache: per-market offer lists with a TTL, plus the current maker's
//! own offers held locally until a refetch shows them
use super::cache::{self, Clock, Entry, Loading, MarketEvent, Stamped};
use super::error::MarketError;
use super::fiat::{self, FiatCode};
use super::ledger::{LedgerAdapter, WriteCall};
use super::types::{Address, EntryId, MarketKey, Offer, OfferKey, Side};
use super::utils;
use super::validate::{OfferDraft, OfferForm};
use anyhow::Context;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

pub struct OfferCache {
    ledger: Arc<LedgerAdapter>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    page_size: u64,
    default_fiat: FiatCode,
    buckets: RwLock<HashMap<MarketKey, Stamped<Vec<Offer>>>>,
    drafts: RwLock<Vec<Entry<Offer>>>,
    owner: RwLock<Option<Address>>,
    // Fetch tickets at or below `floor` started before the last full invalidation.
    tickets: AtomicU64,
    floor: AtomicU64,
    generation: AtomicU64,
    loading: AtomicUsize,
    events: broadcast::Sender<MarketEvent>,
}

impl OfferCache {
    pub fn new(
        ledger: Arc<LedgerAdapter>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        page_size: u64,
        default_fiat: FiatCode,
        events: broadcast::Sender<MarketEvent>,
    ) -> Self {
        Self {
            ledger,
            clock,
            ttl,
            page_size,
            default_fiat,
            buckets: RwLock::new(HashMap::new()),
            drafts: RwLock::new(Vec::new()),
            owner: RwLock::new(None),
            tickets: AtomicU64::new(0),
            floor: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            loading: AtomicUsize::new(0),
            events,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst) > 0
    }

    /// Changing the owner drops every local entry of the previous one.
    pub fn set_owner(&self, owner: Option<Address>) {
        let mut current = cache::write(&self.owner);
        if *current != owner {
            cache::write(&self.drafts).clear();
            *current = owner;
            drop(current);
            self.bump();
        }
    }

    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self
            .events
            .send(MarketEvent::OffersChanged { generation });
        generation
    }

    fn markets(&self, maker_side: Side, fiat: FiatCode) -> Vec<MarketKey> {
        self.ledger
            .tokens()
            .iter()
            .map(|t| MarketKey {
                token: t.address.clone(),
                side: maker_side,
                fiat,
            })
            .collect()
    }

    /// Makes sure the offers a user on `side` can take in `fiat` are cached and
    /// fresh, then returns the merged view. A user buying sees makers selling.
    pub async fn ensure_market(
        &self,
        side: Side,
        fiat: &str,
        force: bool,
    ) -> anyhow::Result<Vec<Offer>> {
        let fiat = fiat::normalize(fiat, self.default_fiat);
        let maker_side = side.inverse();
        let markets = self.markets(maker_side, fiat);

        let now = self.clock.now();
        let stale = force || {
            let buckets = cache::read(&self.buckets);
            markets.iter().any(|m| {
                buckets
                    .get(m)
                    .is_none_or(|bucket| !bucket.is_fresh(now, self.ttl))
            })
        };
        if !stale {
            tracing::debug!(?maker_side, %fiat, "offer market fresh");
            return Ok(self.offers(side, fiat));
        }

        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let fetched = {
            let _loading = Loading::start(&self.loading);
            try_join_all(
                markets
                    .iter()
                    .map(|m| self.ledger.offers(m, self.page_size)),
            )
            .await
            .with_context(|| format!("Failed to load {fiat} offers"))?
        };

        if self.store(&markets, &fetched, ticket) {
            Ok(self.offers(side, fiat))
        } else {
            let chain: Vec<Offer> = fetched.into_iter().flatten().collect();
            Ok(self.view(chain, maker_side, fiat))
        }
    }

    /// Swaps in a market's buckets unless a newer fetch or an invalidation got
    /// there first. Returns whether anything was stored.
    fn store(&self, markets: &[MarketKey], fetched: &[Vec<Offer>], ticket: u64) -> bool {
        if ticket <= self.floor.load(Ordering::SeqCst) {
            tracing::warn!(ticket, "discarding offer fetch that predates an invalidation");
            return false;
        }
        let fetched_at = self.clock.now();
        let mut stored = false;
        {
            let mut buckets = cache::write(&self.buckets);
            for (market, offers) in markets.iter().zip(fetched) {
                if buckets.get(market).is_some_and(|b| b.ticket > ticket) {
                    tracing::warn!(ticket, token = %market.token, "discarding superseded offer fetch");
                    continue;
                }
                buckets.insert(
                    market.clone(),
                    Stamped::new(offers.clone(), fetched_at, ticket),
                );
                stored = true;
            }
        }
        if stored {
            // A refetch that shows an offer supersedes the local copy of it.
            let mut drafts = cache::write(&self.drafts);
            drafts.retain(|entry| {
                let key = entry.value().key();
                !fetched
                    .iter()
                    .flatten()
                    .any(|offer| offer.key() == key)
            });
            drop(drafts);
            let generation = self.bump();
            tracing::debug!(ticket, generation, markets = markets.len(), "offer buckets swapped");
        }
        stored
    }

    /// Current merged offers for a user on `side` in `fiat`, without fetching.
    pub fn offers(&self, side: Side, fiat: FiatCode) -> Vec<Offer> {
        let maker_side = side.inverse();
        let chain: Vec<Offer> = {
            let buckets = cache::read(&self.buckets);
            self.markets(maker_side, fiat)
                .iter()
                .filter_map(|m| buckets.get(m))
                .flat_map(|b| b.value.iter().cloned())
                .collect()
        };
        self.view(chain, maker_side, fiat)
    }

    fn view(&self, chain: Vec<Offer>, maker_side: Side, fiat: FiatCode) -> Vec<Offer> {
        let owner = cache::read(&self.owner).clone();
        let local: Vec<Entry<Offer>> = cache::read(&self.drafts)
            .iter()
            .filter(|e| {
                let o = e.value();
                o.side == maker_side && o.fiat == fiat && Some(&o.maker) == owner.as_ref()
            })
            .cloned()
            .collect();

        let mut merged: Vec<Offer> = cache::merge(&chain, &local, Offer::key)
            .into_iter()
            // Only filter on presence when the ledger actually reported it.
            .filter(|o| o.online != Some(false))
            .collect();
        match maker_side {
            Side::Sell => merged.sort_by(|a, b| a.price.cmp(&b.price)),
            Side::Buy => merged.sort_by(|a, b| b.price.cmp(&a.price)),
        }
        merged
    }

    /// The current owner's offers from the local collection and every bucket.
    pub fn own_offers(&self) -> Vec<Offer> {
        let Some(owner) = cache::read(&self.owner).clone() else {
            return Vec::new();
        };
        let chain: Vec<Offer> = cache::read(&self.buckets)
            .values()
            .flat_map(|b| b.value.iter())
            .filter(|o| o.maker == owner)
            .cloned()
            .collect();
        let local: Vec<Entry<Offer>> = cache::read(&self.drafts).clone();
        cache::merge(&chain, &local, Offer::key)
    }

    /// Looks an offer up in the cached view by its natural key.
    pub fn cached(&self, key: &OfferKey) -> Option<Offer> {
        if let Some(entry) = cache::read(&self.drafts)
            .iter()
            .find(|e| e.is_confirmed() && e.value().key() == *key)
        {
            return Some(entry.value().clone());
        }
        cache::read(&self.buckets)
            .get(&key.market())
            .and_then(|b| b.value.iter().find(|o| o.key() == *key).cloned())
    }

    /// Re-reads one offer and patches it everywhere it is held, or purges it
    /// when the ledger no longer has it.
    pub async fn refresh_offer(&self, key: &OfferKey) -> anyhow::Result<Option<Offer>> {
        let fresh = self
            .ledger
            .offer(key)
            .await
            .context("Failed to refresh offer")?;

        {
            let mut buckets = cache::write(&self.buckets);
            if let Some(bucket) = buckets.get_mut(&key.market()) {
                let mut offers: Vec<Offer> = bucket
                    .value
                    .iter()
                    .filter(|o| o.key() != *key)
                    .cloned()
                    .collect();
                if let Some(offer) = &fresh {
                    offers.push(offer.clone());
                }
                *bucket = Stamped::new(offers, bucket.fetched_at, bucket.ticket);
            }
        }
        let owner = cache::read(&self.owner).clone();
        {
            let mut drafts = cache::write(&self.drafts);
            drafts.retain(|e| e.value().key() != *key);
            if let Some(offer) = fresh.as_ref().filter(|o| owner.as_ref() == Some(&o.maker)) {
                drafts.push(Entry::Confirmed(offer.clone()));
            }
        }
        self.bump();
        Ok(fresh)
    }

    /// Drops every bucket. Fetches already in flight will not be stored.
    pub fn invalidate_all(&self) {
        self.floor
            .store(self.tickets.load(Ordering::SeqCst), Ordering::SeqCst);
        cache::write(&self.buckets).clear();
        self.bump();
    }

    pub async fn create_offer(&self, from: &Address, form: &OfferForm) -> anyhow::Result<Offer> {
        let draft = form.validate_for(self.ledger.tokens())?;
        let key = self.key_for(from, &draft);
        let current = match self.cached(&key) {
            Some(offer) => Some(offer),
            None => self
                .ledger
                .offer(&key)
                .await
                .context("Failed to read current offer")?,
        };
        self.publish(from, draft, current.as_ref()).await
    }

    /// Updates the maker's existing offer in the form's market. Unchanged
    /// fields are sent as no-ops.
    pub async fn update_offer(&self, from: &Address, form: &OfferForm) -> anyhow::Result<Offer> {
        let draft = form.validate_for(self.ledger.tokens())?;
        let key = self.key_for(from, &draft);
        let current = self
            .ledger
            .offer(&key)
            .await
            .context("Failed to read current offer")?
            .ok_or(MarketError::OfferNotFound)?;
        self.publish(from, draft, Some(&current)).await
    }

    fn key_for(&self, from: &Address, draft: &OfferDraft) -> OfferKey {
        OfferKey {
            token: draft.token.address.clone(),
            maker: from.clone(),
            side: draft.side,
            fiat: draft.fiat,
        }
    }

    async fn publish(
        &self,
        from: &Address,
        draft: OfferDraft,
        current: Option<&Offer>,
    ) -> anyhow::Result<Offer> {
        let key = self.key_for(from, &draft);
        let patch = draft.diff(current);
        let call = WriteCall::PutOffer {
            token: key.token.clone(),
            side: key.side,
            fiat: key.fiat,
            patch,
        };
        self.ledger.execute(from, &call).await?;
        self.invalidate_all();

        let offer = match self.ledger.offer(&key).await {
            Ok(Some(offer)) => Entry::Confirmed(offer),
            Ok(None) => {
                tracing::warn!(maker = %from, "published offer not readable yet, using local copy");
                Entry::Draft(self.approximate(from, &draft, current))
            }
            Err(e) => {
                tracing::warn!(maker = %from, error = %e, "offer re-read failed, using local copy");
                Entry::Draft(self.approximate(from, &draft, current))
            }
        };
        {
            let mut drafts = cache::write(&self.drafts);
            drafts.retain(|e| e.value().key() != key);
            drafts.push(offer.clone());
        }
        self.bump();
        Ok(offer.into_value())
    }

    fn approximate(&self, from: &Address, draft: &OfferDraft, current: Option<&Offer>) -> Offer {
        Offer {
            id: current
                .map(|c| c.id.clone())
                .unwrap_or_else(|| EntryId::Draft(utils::draft_id())),
            maker: from.clone(),
            side: draft.side,
            token: draft.token.clone(),
            fiat: draft.fiat,
            price: draft.price,
            min: draft.min,
            max: draft.max,
            reserve: draft.reserve,
            methods: draft.methods.clone(),
            terms: draft.terms.clone(),
            updated_at: self.clock.now(),
            online: current.and_then(|c| c.online),
        }
    }

    pub async fn delete_offer(&self, from: &Address, key: &OfferKey) -> anyhow::Result<()> {
        let call = WriteCall::DeleteOffer {
            token: key.token.clone(),
            side: key.side,
            fiat: key.fiat,
        };
        self.ledger.execute(from, &call).await?;
        cache::write(&self.drafts).retain(|e| e.value().key() != *key);
        self.invalidate_all();
        Ok(())
    }

    /// Presence changes which offers are visible, so every bucket is dropped.
    pub async fn set_online(&self, from: &Address, online: bool) -> anyhow::Result<()> {
        self.ledger
            .execute(from, &WriteCall::SetOnline(online))
            .await?;
        self.invalidate_all();
        Ok(())
    }
}
