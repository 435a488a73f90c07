//! In-process ledger for tests and demos
//!
//! Holds offers and deals in memory and enforces the escrow rules the remote
//! ledger enforces, so dry runs fail for the same reasons. Writes become
//! visible only once confirmed. Knobs let tests switch response shapes, drop
//! the presence flag, hide the next-id preview, fail reads or decline
//! signatures.
use super::{ReadCall, Receipt, Transport, TxHash, WriteCall};
use crate::error::LedgerError;
use crate::types::{Address, DealState, OfferKey, Side};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const DECLINED_MESSAGE: &str = "User rejected the request.";

#[derive(Debug, Clone)]
struct OfferRow {
    price: u64,
    min: u128,
    max: u128,
    reserve: u128,
    methods: String,
    terms: String,
    updated_at: u64,
}

#[derive(Debug, Clone)]
struct NoteRow {
    at: u64,
    state: DealState,
    from_maker: bool,
    text: String,
}

#[derive(Debug, Clone)]
struct DealRow {
    id: u64,
    offer: OfferKey,
    taker: Address,
    amount: u128,
    price: u64,
    state: DealState,
    method: String,
    notes: Vec<NoteRow>,
    updated_at: u64,
}

impl DealRow {
    fn buyer(&self) -> &Address {
        match self.offer.side {
            Side::Buy => &self.offer.maker,
            Side::Sell => &self.taker,
        }
    }
    fn seller(&self) -> &Address {
        match self.offer.side {
            Side::Buy => &self.taker,
            Side::Sell => &self.offer.maker,
        }
    }
    fn is_party(&self, who: &Address) -> bool {
        *who == self.offer.maker || *who == self.taker
    }
}

#[derive(Debug, Default, Clone)]
struct ProfileRow {
    online: bool,
    nickname: String,
    completed: u64,
    canceled: u64,
}

#[derive(Debug, Default)]
struct State {
    offers: BTreeMap<(String, String, u8, u16), (OfferKey, OfferRow)>,
    deals: BTreeMap<u64, DealRow>,
    profiles: HashMap<Address, ProfileRow>,
    pending: HashMap<TxHash, (Address, WriteCall)>,
    next_deal: u64,
    next_tx: u64,
    block: u64,
    clock: u64,
}

fn slot(key: &OfferKey) -> (String, String, u8, u16) {
    (
        key.token.to_string(),
        key.maker.to_string(),
        key.side.to_ledger(),
        key.fiat.raw(),
    )
}

fn rule(reason: &str) -> LedgerError {
    LedgerError::Rule(reason.to_string())
}

fn deal_hex(id: u64) -> String {
    format!("0x{id:064x}")
}

fn parse_deal_id(id: &str) -> Result<u64, LedgerError> {
    let body = id.strip_prefix("0x").unwrap_or(id).trim_start_matches('0');
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16).map_err(|_| rule("unknown deal"))
}

fn find_deal<'a>(state: &'a State, id: &str) -> Result<&'a DealRow, LedgerError> {
    state
        .deals
        .get(&parse_deal_id(id)?)
        .ok_or_else(|| rule("unknown deal"))
}

pub struct MemoryLedger {
    state: Mutex<State>,
    tuple_shape: AtomicBool,
    report_presence: AtomicBool,
    preview_ids: AtomicBool,
    decline_signatures: AtomicBool,
    failing_reads: AtomicUsize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_deal: 1,
                clock: 1_700_000_000,
                ..Default::default()
            }),
            tuple_shape: AtomicBool::new(false),
            report_presence: AtomicBool::new(true),
            preview_ids: AtomicBool::new(true),
            decline_signatures: AtomicBool::new(false),
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Answer reads with positional tuples instead of keyed objects.
    pub fn use_tuple_shape(&self, on: bool) {
        self.tuple_shape.store(on, Ordering::SeqCst);
    }
    /// Omit the maker presence flag from offer reads, like older deployments.
    pub fn report_presence(&self, on: bool) {
        self.report_presence.store(on, Ordering::SeqCst);
    }
    pub fn preview_ids(&self, on: bool) {
        self.preview_ids.store(on, Ordering::SeqCst);
    }
    pub fn decline_signatures(&self, on: bool) {
        self.decline_signatures.store(on, Ordering::SeqCst);
    }
    /// The next `count` reads fail as if the node were unreachable.
    pub fn fail_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn set_profile(&self, who: &Address, online: bool, nickname: &str) {
        let mut state = self.lock();
        let profile = state.profiles.entry(who.clone()).or_default();
        profile.online = online;
        profile.nickname = nickname.to_string();
    }

    /// Applies a write directly, as if another session had confirmed it.
    pub fn apply_external(&self, from: &Address, call: &WriteCall) -> Result<(), LedgerError> {
        let mut state = self.lock();
        Self::check(&state, from, call)?;
        Self::apply(&mut state, from, call);
        Ok(())
    }

    pub fn reserve_of(&self, key: &OfferKey) -> Option<u128> {
        self.lock().offers.get(&slot(key)).map(|(_, row)| row.reserve)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check(state: &State, from: &Address, call: &WriteCall) -> Result<(), LedgerError> {
        let deal = |id: &str| find_deal(state, id);

        match call {
            WriteCall::PutOffer {
                token,
                side,
                fiat,
                patch,
            } => {
                let key = OfferKey {
                    token: token.clone(),
                    maker: from.clone(),
                    side: *side,
                    fiat: *fiat,
                };
                let existing = state.offers.get(&slot(&key)).map(|(_, row)| row);
                let min = patch.min.or(existing.map(|r| r.min));
                let max = patch.max.or(existing.map(|r| r.max));
                let price = patch.price.or(existing.map(|r| r.price));
                match (price, min, max, patch.reserve.or(existing.map(|r| r.reserve))) {
                    (Some(price), Some(min), Some(max), Some(_)) => {
                        if price == 0 {
                            return Err(rule("price is zero"));
                        }
                        if min == 0 || min > max {
                            return Err(rule("amount out of bounds"));
                        }
                        Ok(())
                    }
                    _ => Err(rule("incomplete offer")),
                }
            }
            WriteCall::DeleteOffer { token, side, fiat } => {
                let key = OfferKey {
                    token: token.clone(),
                    maker: from.clone(),
                    side: *side,
                    fiat: *fiat,
                };
                if state.offers.contains_key(&slot(&key)) {
                    Ok(())
                } else {
                    Err(rule("no such offer"))
                }
            }
            WriteCall::SetOnline(_) => Ok(()),
            WriteCall::RequestDeal {
                offer,
                amount,
                price,
                ..
            } => {
                let (_, row) = state
                    .offers
                    .get(&slot(offer))
                    .ok_or_else(|| rule("no such offer"))?;
                if offer.maker == *from {
                    return Err(rule("maker cannot take own offer"));
                }
                let online = state
                    .profiles
                    .get(&offer.maker)
                    .map(|p| p.online)
                    .unwrap_or(false);
                if !online {
                    return Err(rule("maker offline"));
                }
                if row.price != *price {
                    return Err(rule("stale price"));
                }
                if *amount < row.min || *amount > row.max {
                    return Err(rule("amount out of bounds"));
                }
                if *amount > row.reserve {
                    return Err(rule("insufficient reserve"));
                }
                Ok(())
            }
            WriteCall::AcceptDeal { deal_id, .. } => {
                let d = deal(deal_id)?;
                if d.state != DealState::Requested {
                    return Err(rule("wrong state"));
                }
                if d.offer.maker != *from {
                    return Err(rule("wrong caller"));
                }
                Ok(())
            }
            WriteCall::CancelRequest { deal_id, .. } => {
                let d = deal(deal_id)?;
                if d.state != DealState::Requested {
                    return Err(rule("wrong state"));
                }
                if !d.is_party(from) {
                    return Err(rule("wrong caller"));
                }
                Ok(())
            }
            WriteCall::CancelDeal { deal_id, .. } => {
                let d = deal(deal_id)?;
                if d.state != DealState::Accepted {
                    return Err(rule("wrong state"));
                }
                if !d.is_party(from) {
                    return Err(rule("wrong caller"));
                }
                Ok(())
            }
            WriteCall::MarkPaid { deal_id, .. } => {
                let d = deal(deal_id)?;
                if d.state != DealState::Accepted {
                    return Err(rule("wrong state"));
                }
                if d.buyer() != from {
                    return Err(rule("wrong caller"));
                }
                Ok(())
            }
            WriteCall::Release { deal_id, .. } => {
                let d = deal(deal_id)?;
                if d.state != DealState::Paid {
                    return Err(rule("wrong state"));
                }
                if d.seller() != from {
                    return Err(rule("wrong caller"));
                }
                Ok(())
            }
            WriteCall::Message { deal_id, .. } => {
                let d = deal(deal_id)?;
                if !d.is_party(from) {
                    return Err(rule("wrong caller"));
                }
                if d.state.is_terminal() {
                    return Err(rule("deal closed"));
                }
                Ok(())
            }
        }
    }

    fn apply(state: &mut State, from: &Address, call: &WriteCall) {
        state.clock += 1;
        let now = state.clock;

        let push_note = |deal: &mut DealRow, from: &Address, text: &Option<String>| {
            if let Some(text) = text.as_ref().filter(|t| !t.is_empty()) {
                deal.notes.push(NoteRow {
                    at: now,
                    state: deal.state,
                    from_maker: deal.offer.maker == *from,
                    text: text.clone(),
                });
            }
        };

        match call {
            WriteCall::PutOffer {
                token,
                side,
                fiat,
                patch,
            } => {
                let key = OfferKey {
                    token: token.clone(),
                    maker: from.clone(),
                    side: *side,
                    fiat: *fiat,
                };
                let entry = state.offers.entry(slot(&key)).or_insert_with(|| {
                    (
                        key.clone(),
                        OfferRow {
                            price: 0,
                            min: 0,
                            max: 0,
                            reserve: 0,
                            methods: String::new(),
                            terms: String::new(),
                            updated_at: now,
                        },
                    )
                });
                let row = &mut entry.1;
                if let Some(v) = patch.price {
                    row.price = v;
                }
                if let Some(v) = patch.min {
                    row.min = v;
                }
                if let Some(v) = patch.max {
                    row.max = v;
                }
                if let Some(v) = patch.reserve {
                    row.reserve = v;
                }
                if let Some(v) = &patch.methods {
                    row.methods = v.clone();
                }
                if let Some(v) = &patch.terms {
                    row.terms = v.clone();
                }
                row.updated_at = now;
            }
            WriteCall::DeleteOffer { token, side, fiat } => {
                let key = OfferKey {
                    token: token.clone(),
                    maker: from.clone(),
                    side: *side,
                    fiat: *fiat,
                };
                state.offers.remove(&slot(&key));
            }
            WriteCall::SetOnline(online) => {
                state.profiles.entry(from.clone()).or_default().online = *online;
            }
            WriteCall::RequestDeal {
                offer,
                amount,
                price,
                method,
                note,
            } => {
                if let Some((_, row)) = state.offers.get_mut(&slot(offer)) {
                    row.reserve -= *amount;
                    row.updated_at = now;
                }
                let id = state.next_deal;
                state.next_deal += 1;
                let mut deal = DealRow {
                    id,
                    offer: offer.clone(),
                    taker: from.clone(),
                    amount: *amount,
                    price: *price,
                    state: DealState::Requested,
                    method: method.clone(),
                    notes: Vec::new(),
                    updated_at: now,
                };
                push_note(&mut deal, from, note);
                state.deals.insert(id, deal);
            }
            WriteCall::AcceptDeal { deal_id, note }
            | WriteCall::CancelRequest { deal_id, note }
            | WriteCall::CancelDeal { deal_id, note }
            | WriteCall::MarkPaid { deal_id, note }
            | WriteCall::Release { deal_id, note } => {
                let Ok(id) = parse_deal_id(deal_id) else {
                    return;
                };
                let Some(mut deal) = state.deals.remove(&id) else {
                    return;
                };
                let next = match call {
                    WriteCall::AcceptDeal { .. } => DealState::Accepted,
                    WriteCall::MarkPaid { .. } => DealState::Paid,
                    WriteCall::Release { .. } => DealState::Released,
                    _ => DealState::Canceled,
                };
                push_note(&mut deal, from, note);
                deal.state = next;
                deal.updated_at = now;

                match next {
                    DealState::Canceled => {
                        if let Some((_, row)) = state.offers.get_mut(&slot(&deal.offer)) {
                            row.reserve += deal.amount;
                            row.updated_at = now;
                        }
                        state
                            .profiles
                            .entry(deal.offer.maker.clone())
                            .or_default()
                            .canceled += 1;
                    }
                    DealState::Released => {
                        state
                            .profiles
                            .entry(deal.offer.maker.clone())
                            .or_default()
                            .completed += 1;
                    }
                    _ => {}
                }
                state.deals.insert(id, deal);
            }
            WriteCall::Message { deal_id, text } => {
                if let Some(deal) = parse_deal_id(deal_id)
                    .ok()
                    .and_then(|id| state.deals.get_mut(&id))
                {
                    push_note(deal, from, &Some(text.clone()));
                    deal.updated_at = now;
                }
            }
        }
    }

    fn offer_value(&self, state: &State, key: &OfferKey, row: &OfferRow) -> Value {
        let online = state
            .profiles
            .get(&key.maker)
            .map(|p| p.online)
            .unwrap_or(false);
        let presence = self.report_presence.load(Ordering::SeqCst);

        if self.tuple_shape.load(Ordering::SeqCst) {
            let mut tuple = vec![
                json!(key.maker),
                json!(key.token),
                json!(key.side.to_ledger()),
                json!(key.fiat.raw()),
                json!(row.price),
                json!(row.min.to_string()),
                json!(row.max.to_string()),
                json!(row.reserve.to_string()),
                json!(row.methods),
                json!(row.terms),
                json!(row.updated_at),
            ];
            if presence {
                tuple.push(json!(online));
            }
            Value::Array(tuple)
        } else {
            let mut object = json!({
                "maker": key.maker,
                "token": key.token,
                "side": key.side.to_ledger(),
                "fiat": key.fiat.raw(),
                "price": row.price.to_string(),
                "min": row.min.to_string(),
                "max": row.max.to_string(),
                "reserve": row.reserve.to_string(),
                "methods": row.methods,
                "terms": row.terms,
                "updatedAt": row.updated_at,
            });
            if presence {
                object["online"] = json!(online);
            }
            object
        }
    }

    fn deal_value(&self, deal: &DealRow) -> Value {
        let tuple = self.tuple_shape.load(Ordering::SeqCst);
        let notes: Vec<Value> = deal
            .notes
            .iter()
            .map(|n| {
                let state = n.state.to_ledger().unwrap_or(0);
                if tuple {
                    json!([n.at, state, n.from_maker, n.text])
                } else {
                    json!({"at": n.at, "state": state, "fromMaker": n.from_maker, "text": n.text})
                }
            })
            .collect();
        let state = deal.state.to_ledger().unwrap_or(0);

        if tuple {
            json!([
                deal_hex(deal.id),
                deal.offer.token,
                deal.offer.side.to_ledger(),
                deal.offer.fiat.raw(),
                deal.offer.maker,
                deal.taker,
                deal.amount.to_string(),
                deal.price,
                state,
                deal.method,
                deal.updated_at,
                notes,
            ])
        } else {
            json!({
                "id": deal.id,
                "token": deal.offer.token,
                "side": deal.offer.side.to_ledger(),
                "fiat": deal.offer.fiat.raw(),
                "maker": deal.offer.maker,
                "taker": deal.taker,
                "amount": deal.amount.to_string(),
                "price": deal.price,
                "state": state,
                "method": deal.method,
                "updatedAt": deal.updated_at,
                "notes": notes,
            })
        }
    }
}

#[async_trait]
impl Transport for MemoryLedger {
    async fn read(&self, call: &ReadCall) -> Result<Value, LedgerError> {
        if self.take_read_failure() {
            return Err(LedgerError::Unavailable(
                "connection reset by peer. retry later".into(),
            ));
        }
        let state = self.lock();
        let value = match call {
            ReadCall::Offer(key) => match state.offers.get(&slot(key)) {
                Some((key, row)) => self.offer_value(&state, key, row),
                None => Value::Null,
            },
            ReadCall::Offers {
                market,
                offset,
                limit,
            } => {
                let matching: Vec<Value> = state
                    .offers
                    .values()
                    .filter(|(k, _)| {
                        k.token == market.token && k.side == market.side && k.fiat == market.fiat
                    })
                    .map(|(k, row)| self.offer_value(&state, k, row))
                    .collect();
                let start = (*offset as usize).min(matching.len());
                let end = (start + *limit as usize).min(matching.len());
                let next = (end < matching.len()).then_some(end as u64);
                let items = matching[start..end].to_vec();
                if self.tuple_shape.load(Ordering::SeqCst) {
                    json!([items, next])
                } else {
                    json!({"items": items, "next": next})
                }
            }
            ReadCall::Deal(id) => match parse_deal_id(id).ok().and_then(|id| state.deals.get(&id)) {
                Some(deal) => self.deal_value(deal),
                None => Value::Null,
            },
            ReadCall::OpenDeals(who) => Value::Array(
                state
                    .deals
                    .values()
                    .filter(|d| d.is_party(who) && d.state.is_open())
                    .map(|d| self.deal_value(d))
                    .collect(),
            ),
            ReadCall::RecentDeals(who) => Value::Array(
                state
                    .deals
                    .values()
                    .filter(|d| d.is_party(who) && d.state.is_terminal())
                    .map(|d| self.deal_value(d))
                    .collect(),
            ),
            ReadCall::Profile(who) => {
                let p = state.profiles.get(who).cloned().unwrap_or_default();
                if self.tuple_shape.load(Ordering::SeqCst) {
                    json!([p.online, p.nickname, p.completed, p.canceled])
                } else {
                    json!({
                        "online": p.online,
                        "nickname": p.nickname,
                        "dealsCompleted": p.completed,
                        "dealsCanceled": p.canceled,
                    })
                }
            }
            ReadCall::NextDealId => {
                if self.preview_ids.load(Ordering::SeqCst) {
                    json!(deal_hex(state.next_deal))
                } else {
                    Value::Null
                }
            }
        };
        Ok(value)
    }

    async fn simulate(&self, from: &Address, call: &WriteCall) -> Result<(), LedgerError> {
        let state = self.lock();
        Self::check(&state, from, call)
    }

    async fn submit(&self, from: &Address, call: &WriteCall) -> Result<TxHash, LedgerError> {
        if self.decline_signatures.load(Ordering::SeqCst) {
            return Err(LedgerError::Declined(DECLINED_MESSAGE.to_string()));
        }
        let mut state = self.lock();
        state.next_tx += 1;
        let tx = TxHash(format!("0x{:064x}", state.next_tx));
        state.pending.insert(tx.clone(), (from.clone(), call.clone()));
        Ok(tx)
    }

    async fn confirm(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        let mut state = self.lock();
        let (from, call) = state
            .pending
            .remove(tx)
            .ok_or_else(|| LedgerError::Unavailable(format!("unknown transaction {tx}")))?;
        // Rules are checked again: the state may have moved since the dry run.
        Self::check(&state, &from, &call).map_err(|e| LedgerError::Reverted {
            tx: tx.to_string(),
            reason: e.to_string(),
        })?;
        Self::apply(&mut state, &from, &call);
        state.block += 1;
        Ok(Receipt {
            tx: tx.clone(),
            block: state.block,
        })
    }
}
