//! Deal registry: one list of the signed-in account's deals, whichever ledger
//! query returned them and whether or not the ledger has confirmed them yet
use super::cache::{self, Clock, Entry, Loading, MarketEvent, Stamped};
use super::error::{ConfigError, MarketError};
use super::fiat;
use super::ledger::{LedgerAdapter, WriteCall};
use super::types::{Address, ChatNote, Deal, DealState, EntryId, Offer, OfferKey};
use super::utils;
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

/// What a taker submits against an offer.
#[derive(Debug, Clone)]
pub struct DealRequest {
    pub amount: u128,
    pub method: String,
    pub note: Option<String>,
}

/// A request whose local row is still shown, with what is needed to tell its
/// ledger row apart when no id was previewed.
struct Pending {
    draft: EntryId,
    before: HashSet<String>,
    taker: Address,
    offer: OfferKey,
}

pub struct DealRegistry {
    ledger: Arc<LedgerAdapter>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    owner: RwLock<Option<Address>>,
    chain: RwLock<Option<Stamped<Vec<Deal>>>>,
    drafts: RwLock<Vec<Entry<Deal>>>,
    pending: RwLock<Vec<Pending>>,
    tickets: AtomicU64,
    floor: AtomicU64,
    generation: AtomicU64,
    loading: AtomicUsize,
    events: broadcast::Sender<MarketEvent>,
}

/// One row per deal id, the most recently updated copy winning, newest first.
fn dedupe(deals: impl IntoIterator<Item = Deal>) -> Vec<Deal> {
    let mut by_id: HashMap<String, Deal> = HashMap::new();
    for deal in deals {
        let id = deal.id.as_str().to_string();
        match by_id.get(&id) {
            Some(kept) if kept.updated_at >= deal.updated_at => {}
            _ => {
                by_id.insert(id, deal);
            }
        }
    }
    let mut deals: Vec<Deal> = by_id.into_values().collect();
    sort_newest_first(&mut deals);
    deals
}

fn sort_newest_first(deals: &mut [Deal]) {
    deals.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
}

fn deal_key(deal: &Deal) -> String {
    deal.id.as_str().to_string()
}

impl DealRegistry {
    pub fn new(
        ledger: Arc<LedgerAdapter>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        events: broadcast::Sender<MarketEvent>,
    ) -> Self {
        Self {
            ledger,
            clock,
            ttl,
            owner: RwLock::new(None),
            chain: RwLock::new(None),
            drafts: RwLock::new(Vec::new()),
            pending: RwLock::new(Vec::new()),
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

    pub fn owner(&self) -> Option<Address> {
        cache::read(&self.owner).clone()
    }

    /// Switching accounts tears the whole view down, drafts included.
    pub fn set_owner(&self, owner: Option<Address>) {
        let mut current = cache::write(&self.owner);
        if *current == owner {
            return;
        }
        *current = owner;
        drop(current);
        self.floor
            .store(self.tickets.load(Ordering::SeqCst), Ordering::SeqCst);
        *cache::write(&self.chain) = None;
        cache::write(&self.drafts).clear();
        cache::write(&self.pending).clear();
        self.bump();
    }

    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(MarketEvent::DealsChanged { generation });
        generation
    }

    fn require_owner(&self) -> Result<Address, ConfigError> {
        self.owner().ok_or(ConfigError::NoSigner)
    }

    /// Reads open and recent deals together and swaps them in as one list.
    pub async fn fetch_and_set_deals(&self) -> anyhow::Result<Vec<Deal>> {
        let owner = self.require_owner()?;
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let (open, recent) = {
            let _loading = Loading::start(&self.loading);
            tokio::try_join!(
                self.ledger.open_deals(&owner),
                self.ledger.recent_deals(&owner)
            )
            .context("Failed to load deals")?
        };
        let fetched = dedupe(open.into_iter().chain(recent));

        if ticket <= self.floor.load(Ordering::SeqCst) {
            tracing::warn!(ticket, "discarding deal fetch that predates a reset");
            return Ok(fetched);
        }
        {
            let mut chain = cache::write(&self.chain);
            if chain.as_ref().is_some_and(|c| c.ticket > ticket) {
                tracing::warn!(ticket, "discarding superseded deal fetch");
                return Ok(fetched);
            }
            *chain = Some(Stamped::new(fetched.clone(), self.clock.now(), ticket));
        }
        self.settle_drafts(&fetched);
        let generation = self.bump();
        tracing::debug!(ticket, generation, deals = fetched.len(), "deal list swapped");
        Ok(fetched)
    }

    /// Drops local rows the fetched list now accounts for. A row goes when its
    /// id shows up, or when there are at least as many new deals for its taker
    /// and offer as there are requests still waiting on them.
    fn settle_drafts(&self, fetched: &[Deal]) {
        let ids: HashSet<&str> = fetched.iter().map(|d| d.id.as_str()).collect();
        let mut drafts = cache::write(&self.drafts);
        let mut pending = cache::write(&self.pending);
        drafts.retain(|e| !ids.contains(e.value().id.as_str()));
        pending.retain(|p| drafts.iter().any(|e| e.value().id == p.draft));

        let settled: HashSet<String> = {
            let mut groups: HashMap<(&Address, &OfferKey), Vec<&Pending>> = HashMap::new();
            for p in pending.iter() {
                groups.entry((&p.taker, &p.offer)).or_default().push(p);
            }
            groups
                .into_iter()
                .filter(|((taker, offer), waiting)| {
                    let fresh = fetched
                        .iter()
                        .filter(|d| d.taker == **taker && d.offer_key() == **offer)
                        .filter_map(Deal::ledger_id)
                        .filter(|id| waiting.iter().any(|p| !p.before.contains(*id)))
                        .count();
                    fresh >= waiting.len()
                })
                .flat_map(|(_, waiting)| waiting.into_iter().map(|p| p.draft.as_str().to_string()))
                .collect()
        };
        if !settled.is_empty() {
            tracing::debug!(drafts = settled.len(), "local deal rows settled by elimination");
            drafts.retain(|e| !settled.contains(e.value().id.as_str()));
            pending.retain(|p| !settled.contains(p.draft.as_str()));
        }
    }

    fn forget_draft(&self, id: &EntryId) {
        cache::write(&self.drafts).retain(|d| d.value().id != *id);
        cache::write(&self.pending).retain(|p| p.draft != *id);
    }

    /// Refetches only when the list is older than the TTL or `force` is set.
    pub async fn ensure_deals(&self, force: bool) -> anyhow::Result<Vec<Deal>> {
        let fresh = cache::read(&self.chain)
            .as_ref()
            .is_some_and(|c| c.is_fresh(self.clock.now(), self.ttl));
        if fresh && !force {
            tracing::debug!("deal list fresh");
            return Ok(self.deals());
        }
        self.fetch_and_set_deals().await?;
        Ok(self.deals())
    }

    /// Confirmed rows merged with local entries, newest first.
    pub fn deals(&self) -> Vec<Deal> {
        let chain: Vec<Deal> = cache::read(&self.chain)
            .as_ref()
            .map(|c| c.value.as_ref().clone())
            .unwrap_or_default();
        let local = cache::read(&self.drafts).clone();
        let mut merged = cache::merge(&chain, &local, deal_key);
        sort_newest_first(&mut merged);
        merged
    }

    pub fn open_deals(&self) -> Vec<Deal> {
        self.deals()
            .into_iter()
            .filter(|d| !d.state.is_terminal())
            .collect()
    }

    pub fn recent_deals(&self) -> Vec<Deal> {
        self.deals()
            .into_iter()
            .filter(|d| d.state.is_terminal())
            .collect()
    }

    pub fn deal(&self, id: &str) -> Option<Deal> {
        self.deals().into_iter().find(|d| d.id.as_str() == id)
    }

    /// A deal that state-changing calls may target: known and confirmed.
    pub fn resolve(&self, id: &str) -> Result<Deal, MarketError> {
        let deal = self
            .deal(id)
            .ok_or_else(|| MarketError::DealNotFound(id.to_string()))?;
        if deal.ledger_id().is_none() {
            return Err(MarketError::DealNotConfirmed(id.to_string()));
        }
        Ok(deal)
    }

    /// Re-reads one deal and patches it into the view, or drops it when the
    /// ledger no longer knows it.
    pub async fn refresh_deal(&self, id: &str) -> anyhow::Result<Option<Deal>> {
        let owner = self.require_owner()?;
        let fresh = self
            .ledger
            .deal(id, &owner)
            .await
            .with_context(|| format!("Failed to refresh deal {id}"))?;

        let mut in_chain = false;
        {
            let mut chain = cache::write(&self.chain);
            if let Some(stamped) = chain.as_mut() {
                in_chain = stamped.value.iter().any(|d| d.id.as_str() == id);
                if in_chain {
                    let deals: Vec<Deal> = stamped
                        .value
                        .iter()
                        .filter_map(|d| {
                            if d.id.as_str() == id {
                                fresh.clone()
                            } else {
                                Some(d.clone())
                            }
                        })
                        .collect();
                    *stamped = Stamped::new(deals, stamped.fetched_at, stamped.ticket);
                }
            }
        }
        {
            let mut drafts = cache::write(&self.drafts);
            drafts.retain(|e| e.value().id.as_str() != id);
            if let Some(deal) = fresh.as_ref().filter(|_| !in_chain) {
                drafts.push(Entry::Confirmed(deal.clone()));
            }
        }
        self.bump();
        Ok(fresh)
    }

    fn known_ids(&self) -> Option<HashSet<String>> {
        cache::read(&self.chain).as_ref().map(|c| {
            c.value
                .iter()
                .filter_map(|d| d.ledger_id().map(str::to_string))
                .collect()
        })
    }

    /// Requests a deal against `offer` at the price the taker is looking at.
    ///
    /// A placeholder row is shown while the request is in flight. Afterwards
    /// the new deal is found by the previewed id, or failing that as the one
    /// id that was not there before. Another session requesting in the same
    /// window can defeat the second rule; candidates are narrowed to this
    /// taker and this offer to keep that unlikely.
    pub async fn create_deal(&self, offer: &Offer, request: DealRequest) -> anyhow::Result<Deal> {
        let taker = self.require_owner()?;

        let preview = match self.ledger.preview_next_deal_id().await {
            Ok(preview) => preview,
            Err(e) => {
                tracing::warn!(error = %e, "next deal id unavailable");
                None
            }
        };
        let before = match self.known_ids() {
            Some(ids) => ids,
            None => {
                self.fetch_and_set_deals().await?;
                self.known_ids().unwrap_or_default()
            }
        };

        let placeholder = self.placeholder(offer, &taker, &request, preview.clone());
        let placeholder_id = placeholder.id.clone();
        cache::write(&self.drafts).push(Entry::Draft(placeholder.clone()));
        cache::write(&self.pending).push(Pending {
            draft: placeholder_id.clone(),
            before: before.clone(),
            taker: taker.clone(),
            offer: offer.key(),
        });
        self.bump();

        let call = WriteCall::RequestDeal {
            offer: offer.key(),
            amount: request.amount,
            price: offer.price,
            method: request.method.clone(),
            note: request.note.clone(),
        };
        if let Err(e) = self.ledger.execute(&taker, &call).await {
            self.forget_draft(&placeholder_id);
            self.bump();
            return Err(e.into());
        }

        let fetched = match self.fetch_and_set_deals().await {
            Ok(deals) => deals,
            Err(e) => {
                tracing::warn!(error = %e, "deal list unavailable after request, keeping local row");
                return Ok(placeholder);
            }
        };

        let by_preview = preview
            .as_deref()
            .and_then(|id| fetched.iter().find(|d| d.ledger_id() == Some(id)));
        let found = by_preview.cloned().or_else(|| {
            let key = offer.key();
            let mut fresh = fetched.iter().filter(|d| {
                d.ledger_id().is_some_and(|id| !before.contains(id))
                    && d.taker == taker
                    && d.offer_key() == key
            });
            match (fresh.next(), fresh.next()) {
                (Some(only), None) => Some(only.clone()),
                _ => None,
            }
        });

        match found {
            Some(deal) => {
                self.forget_draft(&placeholder_id);
                self.bump();
                tracing::debug!(deal = %deal.id, "requested deal matched");
                Ok(deal)
            }
            None => {
                tracing::warn!(placeholder = %placeholder_id, "requested deal not identified after refetch");
                Ok(placeholder)
            }
        }
    }

    fn placeholder(
        &self,
        offer: &Offer,
        taker: &Address,
        request: &DealRequest,
        preview: Option<String>,
    ) -> Deal {
        let now = self.clock.now();
        let notes = request
            .note
            .iter()
            .filter(|n| !n.is_empty())
            .map(|text| ChatNote {
                at: now,
                state: DealState::Requested,
                from_maker: false,
                text: text.clone(),
            })
            .collect();
        Deal {
            id: EntryId::Draft(preview.unwrap_or_else(utils::draft_id)),
            side: offer.side,
            token: offer.token.clone(),
            amount: request.amount,
            price: offer.price,
            fiat: offer.fiat,
            fiat_label: fiat::label(offer.fiat),
            maker: offer.maker.clone(),
            taker: taker.clone(),
            partner: offer.maker.clone(),
            state: DealState::Requested,
            method: request.method.clone(),
            notes,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiat::FiatCode;
    use crate::types::{Side, TimeStamp, TokenInfo};

    fn deal(id: &str, updated: i64, state: DealState) -> Deal {
        let token = Address::parse("0x00000000000000000000000000000000000000cc").unwrap();
        let maker = Address::parse("0x00000000000000000000000000000000000000aa").unwrap();
        let taker = Address::parse("0x00000000000000000000000000000000000000bb").unwrap();
        Deal {
            id: EntryId::Ledger(id.into()),
            side: Side::Sell,
            token: TokenInfo {
                address: token,
                symbol: "USDT".into(),
                decimals: 6,
            },
            amount: 1,
            price: 1,
            fiat: FiatCode::parse("DE").unwrap(),
            fiat_label: "EUR (Germany)".into(),
            maker: maker.clone(),
            taker,
            partner: maker,
            state,
            method: "SEPA".into(),
            notes: Vec::new(),
            updated_at: TimeStamp::from_unix(updated),
        }
    }

    #[test]
    fn deal_in_both_queries_is_kept_once() {
        let open = vec![deal("0x01", 10, DealState::Accepted)];
        let recent = vec![
            deal("0x01", 12, DealState::Released),
            deal("0x02", 11, DealState::Canceled),
        ];

        let merged = dedupe(open.into_iter().chain(recent));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id.as_str(), "0x01");
        assert_eq!(merged[0].state, DealState::Released);
        assert_eq!(merged[1].id.as_str(), "0x02");
    }
}
