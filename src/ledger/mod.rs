//! Typed access to the escrow ledger
//!
//! [`Transport`] is the narrow seam to the remote ledger: raw reads whose
//! responses may come back positional or keyed, and writes split into a dry
//! run, a submission and a confirmation. [`LedgerAdapter`] sits on top and is
//! the only place raw responses are turned into [`Offer`], [`Deal`] and
//! [`MakerProfile`] values.
pub mod normalize;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use super::error::LedgerError;
use super::fiat::FiatCode;
use super::types::{Address, Deal, MakerProfile, MarketKey, Offer, OfferKey, Side, TokenInfo};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCall {
    Offer(OfferKey),
    Offers {
        market: MarketKey,
        offset: u64,
        limit: u64,
    },
    Deal(String),
    OpenDeals(Address),
    RecentDeals(Address),
    Profile(Address),
    NextDealId,
}

/// Offer fields to write. `None` leaves the on-chain value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferPatch {
    pub price: Option<u64>,
    pub min: Option<u128>,
    pub max: Option<u128>,
    pub reserve: Option<u128>,
    pub methods: Option<String>,
    pub terms: Option<String>,
}

impl OfferPatch {
    pub fn is_empty(&self) -> bool {
        *self == OfferPatch::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCall {
    PutOffer {
        token: Address,
        side: Side,
        fiat: FiatCode,
        patch: OfferPatch,
    },
    DeleteOffer {
        token: Address,
        side: Side,
        fiat: FiatCode,
    },
    SetOnline(bool),
    /// `price` is the price the taker last observed; the ledger refuses the
    /// request if the offer has moved since.
    RequestDeal {
        offer: OfferKey,
        amount: u128,
        price: u64,
        method: String,
        note: Option<String>,
    },
    AcceptDeal {
        deal_id: String,
        note: Option<String>,
    },
    CancelRequest {
        deal_id: String,
        note: Option<String>,
    },
    CancelDeal {
        deal_id: String,
        note: Option<String>,
    },
    MarkPaid {
        deal_id: String,
        note: Option<String>,
    },
    Release {
        deal_id: String,
        note: Option<String>,
    },
    Message {
        deal_id: String,
        text: String,
    },
}

impl WriteCall {
    pub fn name(&self) -> &'static str {
        match self {
            WriteCall::PutOffer { .. } => "offer",
            WriteCall::DeleteOffer { .. } => "deleteOffer",
            WriteCall::SetOnline(_) => "setOnline",
            WriteCall::RequestDeal { .. } => "createDeal",
            WriteCall::AcceptDeal { .. } => "acceptDeal",
            WriteCall::CancelRequest { .. } => "cancelRequest",
            WriteCall::CancelDeal { .. } => "cancelDeal",
            WriteCall::MarkPaid { .. } => "paidDeal",
            WriteCall::Release { .. } => "releaseDeal",
            WriteCall::Message { .. } => "message",
        }
    }
    pub fn deal_id(&self) -> Option<&str> {
        match self {
            WriteCall::AcceptDeal { deal_id, .. }
            | WriteCall::CancelRequest { deal_id, .. }
            | WriteCall::CancelDeal { deal_id, .. }
            | WriteCall::MarkPaid { deal_id, .. }
            | WriteCall::Release { deal_id, .. }
            | WriteCall::Message { deal_id, .. } => Some(deal_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx: TxHash,
    pub block: u64,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn read(&self, call: &ReadCall) -> Result<Value, LedgerError>;
    /// Dry run. Fails with [`LedgerError::Rule`] when the ledger would refuse the call.
    async fn simulate(&self, from: &Address, call: &WriteCall) -> Result<(), LedgerError>;
    async fn submit(&self, from: &Address, call: &WriteCall) -> Result<TxHash, LedgerError>;
    async fn confirm(&self, tx: &TxHash) -> Result<Receipt, LedgerError>;
}

/// A submitted write that has not been confirmed yet.
#[must_use = "a submitted write must be awaited until confirmed"]
pub struct PendingTx {
    pub tx: TxHash,
    call: &'static str,
    transport: Arc<dyn Transport>,
}

impl PendingTx {
    pub async fn confirmed(self) -> Result<Receipt, LedgerError> {
        let receipt = self.transport.confirm(&self.tx).await?;
        tracing::info!(call = self.call, tx = %receipt.tx, block = receipt.block, "write confirmed");
        Ok(receipt)
    }
}

pub struct LedgerAdapter {
    transport: Arc<dyn Transport>,
    address: Address,
    tokens: Vec<TokenInfo>,
}

impl LedgerAdapter {
    pub fn new(transport: Arc<dyn Transport>, address: Address, tokens: Vec<TokenInfo>) -> Self {
        Self {
            transport,
            address,
            tokens,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn tokens(&self) -> &[TokenInfo] {
        &self.tokens
    }

    /// Configured token metadata, or a placeholder for tokens this session does not list.
    pub fn token(&self, address: &Address) -> TokenInfo {
        self.tokens
            .iter()
            .find(|t| t.address == *address)
            .cloned()
            .unwrap_or_else(|| TokenInfo {
                address: address.clone(),
                symbol: address.as_str().chars().take(8).collect(),
                decimals: 18,
            })
    }

    pub async fn offer(&self, key: &OfferKey) -> Result<Option<Offer>, LedgerError> {
        let raw = self.transport.read(&ReadCall::Offer(key.clone())).await?;
        normalize::offer(&raw, |a| self.token(a))
    }

    /// All offers of one market, following pagination to the end.
    pub async fn offers(&self, market: &MarketKey, page_size: u64) -> Result<Vec<Offer>, LedgerError> {
        let mut offers = Vec::new();
        let mut offset = 0;
        loop {
            let raw = self
                .transport
                .read(&ReadCall::Offers {
                    market: market.clone(),
                    offset,
                    limit: page_size.max(1),
                })
                .await?;
            let (items, next) = normalize::page(&raw)?;
            for item in &items {
                if let Some(offer) = normalize::offer(item, |a| self.token(a))? {
                    offers.push(offer);
                }
            }
            match next {
                Some(n) if n > offset => offset = n,
                _ => break,
            }
        }
        Ok(offers)
    }

    pub async fn deal(&self, id: &str, viewer: &Address) -> Result<Option<Deal>, LedgerError> {
        let raw = self.transport.read(&ReadCall::Deal(id.to_string())).await?;
        if raw.is_null() {
            return Ok(None);
        }
        normalize::deal(&raw, viewer, |a| self.token(a)).map(Some)
    }

    pub async fn open_deals(&self, account: &Address) -> Result<Vec<Deal>, LedgerError> {
        let raw = self
            .transport
            .read(&ReadCall::OpenDeals(account.clone()))
            .await?;
        normalize::deals(&raw, account, |a| self.token(a))
    }

    pub async fn recent_deals(&self, account: &Address) -> Result<Vec<Deal>, LedgerError> {
        let raw = self
            .transport
            .read(&ReadCall::RecentDeals(account.clone()))
            .await?;
        normalize::deals(&raw, account, |a| self.token(a))
    }

    pub async fn profile(&self, maker: &Address) -> Result<MakerProfile, LedgerError> {
        let raw = self.transport.read(&ReadCall::Profile(maker.clone())).await?;
        normalize::profile(&raw)
    }

    /// The id the next requested deal is expected to receive, if the ledger exposes it.
    pub async fn preview_next_deal_id(&self) -> Result<Option<String>, LedgerError> {
        let raw = self.transport.read(&ReadCall::NextDealId).await?;
        if raw.is_null() {
            return Ok(None);
        }
        normalize::deal_id(&raw).map(Some)
    }

    pub async fn simulate(&self, from: &Address, call: &WriteCall) -> Result<(), LedgerError> {
        self.transport.simulate(from, call).await
    }

    pub async fn submit(&self, from: &Address, call: &WriteCall) -> Result<PendingTx, LedgerError> {
        let tx = self.transport.submit(from, call).await?;
        tracing::debug!(ledger = %self.address, call = call.name(), tx = %tx, "write submitted");
        Ok(PendingTx {
            tx,
            call: call.name(),
            transport: Arc::clone(&self.transport),
        })
    }

    /// Dry run, submit, then wait for confirmation. A refused dry run never
    /// reaches the signer.
    pub async fn execute(&self, from: &Address, call: &WriteCall) -> Result<Receipt, LedgerError> {
        self.simulate(from, call).await?;
        self.submit(from, call).await?.confirmed().await
    }
}
