//! Action orchestration and the surface the presentation layer consumes
//!
//! Every state-changing call runs the same steps: resolve the session, resolve
//! the target from the merged cache view, check local preconditions, write
//! through the ledger, then refresh whatever the write touched. Failures are
//! classified, logged at the matching severity and returned with a short
//! user-facing message on top of the original cause.
use super::amount;
use super::cache::{Clock, MarketEvent};
use super::classify;
use super::config::MarketConfig;
use super::deals::{DealRegistry, DealRequest};
use super::error::{ConfigError, MarketError, ValidationError};
use super::fiat::FiatCode;
use super::ledger::{LedgerAdapter, Transport, WriteCall};
use super::lifecycle::{self, Action, Scenario};
use super::offers::OfferCache;
use super::types::{Address, Deal, DealState, MakerProfile, Offer, OfferKey, Role, Side};
use super::validate::OfferForm;
use anyhow::Context;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Caches and ledger access for one network session.
struct Market {
    ledger: Arc<LedgerAdapter>,
    offers: OfferCache,
    deals: DealRegistry,
}

pub struct Orchestrator {
    account: RwLock<Option<Address>>,
    market: Result<Market, ConfigError>,
    events: broadcast::Sender<MarketEvent>,
}

impl Orchestrator {
    /// Builds the session. A missing transport or ledger address is not an
    /// error here; it is reported by the first call that needs the ledger.
    pub fn new(
        config: &MarketConfig,
        transport: Option<Arc<dyn Transport>>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tokens = config.token_infos().context("Invalid token configuration")?;

        let market = match transport {
            None => Err(ConfigError::NoNetworkClient),
            Some(transport) => config.ledger_address().map(|address| {
                let ledger = Arc::new(LedgerAdapter::new(transport, address, tokens));
                Market {
                    offers: OfferCache::new(
                        Arc::clone(&ledger),
                        Arc::clone(&clock),
                        config.cache_ttl(),
                        config.offer_page_size as u64,
                        config.default_fiat(),
                        events.clone(),
                    ),
                    deals: DealRegistry::new(
                        Arc::clone(&ledger),
                        Arc::clone(&clock),
                        config.cache_ttl(),
                        events.clone(),
                    ),
                    ledger,
                }
            }),
        };
        if let Err(e) = &market {
            tracing::warn!(chain_id = config.chain_id, error = %e, "session has no ledger");
        }

        Ok(Self {
            account: RwLock::new(None),
            market,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events.subscribe()
    }

    pub fn account(&self) -> Option<Address> {
        super::cache::read(&self.account).clone()
    }

    /// Switches the signer. Deal views and local drafts of the previous
    /// account are dropped.
    pub fn set_account(&self, account: Option<Address>) {
        *super::cache::write(&self.account) = account.clone();
        if let Ok(market) = &self.market {
            market.offers.set_owner(account.clone());
            market.deals.set_owner(account);
        }
    }

    fn market(&self) -> Result<&Market, ConfigError> {
        self.market.as_ref().map_err(Clone::clone)
    }

    /// Signer, network client and ledger address, checked in that order.
    fn context(&self) -> Result<(Address, &Market), ConfigError> {
        let account = self.account().ok_or(ConfigError::NoSigner)?;
        Ok((account, self.market()?))
    }

    pub fn offers_loading(&self) -> bool {
        self.market.as_ref().is_ok_and(|m| m.offers.is_loading())
    }

    pub fn deals_loading(&self) -> bool {
        self.market.as_ref().is_ok_and(|m| m.deals.is_loading())
    }

    pub fn offers_generation(&self) -> u64 {
        self.market.as_ref().map_or(0, |m| m.offers.generation())
    }

    pub fn deals_generation(&self) -> u64 {
        self.market.as_ref().map_or(0, |m| m.deals.generation())
    }

    /// Runs `step` and, on failure, logs it by class and puts the short
    /// message on top of the error unless it already reads that way.
    async fn run<T, F>(action: &'static str, step: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match step.await {
            Ok(value) => Ok(value),
            Err(err) => {
                let message = classify::report(action, &err);
                if err.to_string() == message {
                    Err(err)
                } else {
                    Err(err.context(message))
                }
            }
        }
    }

    // Reads

    pub async fn ensure_market(&self, side: Side, fiat: &str, force: bool) -> anyhow::Result<Vec<Offer>> {
        Self::run("load offers", async {
            self.market()?.offers.ensure_market(side, fiat, force).await
        })
        .await
    }

    pub fn offers(&self, side: Side, fiat: FiatCode) -> Vec<Offer> {
        self.market
            .as_ref()
            .map(|m| m.offers.offers(side, fiat))
            .unwrap_or_default()
    }

    pub fn own_offers(&self) -> Vec<Offer> {
        self.market
            .as_ref()
            .map(|m| m.offers.own_offers())
            .unwrap_or_default()
    }

    pub async fn ensure_deals(&self, force: bool) -> anyhow::Result<Vec<Deal>> {
        Self::run("load deals", async {
            let (_, market) = self.context()?;
            market.deals.ensure_deals(force).await
        })
        .await
    }

    pub fn deals(&self) -> Vec<Deal> {
        self.market
            .as_ref()
            .map(|m| m.deals.deals())
            .unwrap_or_default()
    }

    pub fn open_deals(&self) -> Vec<Deal> {
        self.market
            .as_ref()
            .map(|m| m.deals.open_deals())
            .unwrap_or_default()
    }

    pub fn recent_deals(&self) -> Vec<Deal> {
        self.market
            .as_ref()
            .map(|m| m.deals.recent_deals())
            .unwrap_or_default()
    }

    pub fn deal(&self, id: &str) -> Option<Deal> {
        self.market.as_ref().ok().and_then(|m| m.deals.deal(id))
    }

    pub async fn profile(&self, maker: &Address) -> anyhow::Result<MakerProfile> {
        Self::run("load profile", async {
            anyhow::Ok(self.market()?.ledger.profile(maker).await?)
        })
        .await
    }

    /// The lifecycle cell the signed-in account sees for a deal.
    pub fn scenario(&self, deal: &Deal) -> Option<Scenario> {
        let role = deal.role_of(&self.account()?)?;
        lifecycle::scenario(role, lifecycle::user_side(role, deal.side), deal.state)
    }

    // Offer writes

    pub async fn create_offer(&self, form: &OfferForm) -> anyhow::Result<Offer> {
        Self::run("create offer", async {
            let (account, market) = self.context()?;
            market.offers.create_offer(&account, form).await
        })
        .await
    }

    pub async fn update_offer(&self, form: &OfferForm) -> anyhow::Result<Offer> {
        Self::run("update offer", async {
            let (account, market) = self.context()?;
            market.offers.update_offer(&account, form).await
        })
        .await
    }

    pub async fn delete_offer(&self, key: &OfferKey) -> anyhow::Result<()> {
        Self::run("delete offer", async {
            let (account, market) = self.context()?;
            if key.maker != account {
                return Err(MarketError::OfferNotFound.into());
            }
            market.offers.delete_offer(&account, key).await
        })
        .await
    }

    pub async fn set_online(&self, online: bool) -> anyhow::Result<()> {
        Self::run("set presence", async {
            let (account, market) = self.context()?;
            market.offers.set_online(&account, online).await
        })
        .await
    }

    // Deal writes

    /// Requests `amount` (decimal text) from `offer` at the offer's price as
    /// currently shown.
    pub async fn request_deal(
        &self,
        offer: &Offer,
        amount: &str,
        method: &str,
        comment: Option<&str>,
    ) -> anyhow::Result<Deal> {
        Self::run(Action::Request.label(), async {
            let (account, market) = self.context()?;
            if offer.maker == account {
                return Err(ValidationError::ActionNotAllowed {
                    action: Action::Request.label(),
                    state: DealState::New,
                }
                .into());
            }
            let side = lifecycle::user_side(Role::Taker, offer.side);
            let cell = lifecycle::scenario(Role::Taker, side, DealState::New)
                .filter(|c| c.allows(Action::Request))
                .ok_or(ValidationError::ActionNotAllowed {
                    action: Action::Request.label(),
                    state: DealState::New,
                })?;

            let units = amount::parse_units("amount", amount, offer.token.decimals)?;
            if units < offer.min || units > offer.max {
                return Err(ValidationError::InvalidAmount {
                    field: "amount",
                    reason: format!(
                        "must be between {} and {}",
                        amount::format_units(offer.min, offer.token.decimals),
                        amount::format_units(offer.max, offer.token.decimals)
                    ),
                }
                .into());
            }
            if units > offer.reserve {
                return Err(ValidationError::InvalidAmount {
                    field: "amount",
                    reason: "exceeds what the offer has left".into(),
                }
                .into());
            }
            let method = offer
                .payment_methods()
                .find(|m| m.eq_ignore_ascii_case(method.trim()))
                .ok_or_else(|| {
                    ValidationError::InvalidPaymentMethods(format!(
                        "{:?} is not offered",
                        method.trim()
                    ))
                })?
                .to_string();
            let note = cell.note_for(Action::Request, comment)?;

            let deal = market
                .deals
                .create_deal(
                    offer,
                    DealRequest {
                        amount: units,
                        method,
                        note,
                    },
                )
                .await?;
            self.refresh_offer(market, &offer.key()).await;
            anyhow::Ok(deal)
        })
        .await
    }

    pub async fn accept(&self, deal_id: &str, comment: Option<&str>) -> anyhow::Result<Deal> {
        self.invoke(Action::Accept, deal_id, comment).await
    }

    pub async fn cancel(&self, deal_id: &str, comment: Option<&str>) -> anyhow::Result<Deal> {
        self.invoke(Action::Cancel, deal_id, comment).await
    }

    pub async fn mark_paid(&self, deal_id: &str, comment: Option<&str>) -> anyhow::Result<Deal> {
        self.invoke(Action::MarkPaid, deal_id, comment).await
    }

    pub async fn release(&self, deal_id: &str, comment: Option<&str>) -> anyhow::Result<Deal> {
        self.invoke(Action::Release, deal_id, comment).await
    }

    /// Runs a lifecycle action against an existing deal. Requests go through
    /// [`Orchestrator::request_deal`].
    pub async fn invoke(
        &self,
        action: Action,
        deal_id: &str,
        comment: Option<&str>,
    ) -> anyhow::Result<Deal> {
        Self::run(action.label(), async {
            let (account, market) = self.context()?;
            let deal = market.deals.resolve(deal_id)?;
            let call = Self::plan(&account, &deal, action, comment)?;

            market.ledger.execute(&account, &call).await?;
            anyhow::Ok(self.after_deal_write(market, &deal).await)
        })
        .await
    }

    /// Local checks for `action` on `deal`, producing the ledger write.
    fn plan(
        account: &Address,
        deal: &Deal,
        action: Action,
        comment: Option<&str>,
    ) -> anyhow::Result<WriteCall> {
        let deal_id = deal
            .ledger_id()
            .ok_or_else(|| MarketError::DealNotConfirmed(deal.id.to_string()))?
            .to_string();
        let role = deal
            .role_of(account)
            .ok_or_else(|| MarketError::NotAParty(deal_id.clone()))?;

        let required = match action {
            Action::MarkPaid => Some(DealState::Accepted),
            Action::Release => Some(DealState::Paid),
            _ => None,
        };
        if let Some(expected) = required.filter(|s| *s != deal.state) {
            return Err(ValidationError::WrongState {
                expected,
                actual: deal.state,
            }
            .into());
        }

        let not_allowed = ValidationError::ActionNotAllowed {
            action: action.label(),
            state: deal.state,
        };
        let cell = lifecycle::scenario(role, lifecycle::user_side(role, deal.side), deal.state)
            .filter(|c| c.allows(action))
            .ok_or(not_allowed.clone())?;
        let note = cell.note_for(action, comment)?;

        let call = match action {
            Action::Accept => WriteCall::AcceptDeal { deal_id, note },
            Action::Cancel => match deal.state {
                DealState::Requested => WriteCall::CancelRequest { deal_id, note },
                DealState::Accepted => WriteCall::CancelDeal { deal_id, note },
                _ => return Err(not_allowed.into()),
            },
            Action::MarkPaid => WriteCall::MarkPaid { deal_id, note },
            Action::Release => WriteCall::Release { deal_id, note },
            Action::Request => return Err(not_allowed.into()),
        };
        Ok(call)
    }

    /// Appends a chat note to an open deal.
    pub async fn send_message(&self, deal_id: &str, text: &str) -> anyhow::Result<Deal> {
        Self::run("send message", async {
            let (account, market) = self.context()?;
            let text = text.trim();
            if text.is_empty() {
                return Err(ValidationError::EmptyMessage.into());
            }
            let deal = market.deals.resolve(deal_id)?;
            let ledger_id = deal.ledger_id().unwrap_or_default().to_string();
            if deal.role_of(&account).is_none() {
                return Err(MarketError::NotAParty(ledger_id).into());
            }
            if deal.state.is_terminal() {
                return Err(ValidationError::ActionNotAllowed {
                    action: "Message",
                    state: deal.state,
                }
                .into());
            }
            let call = WriteCall::Message {
                deal_id: ledger_id.clone(),
                text: text.to_string(),
            };
            market.ledger.execute(&account, &call).await?;
            anyhow::Ok(market
                .deals
                .refresh_deal(&ledger_id)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(deal = %ledger_id, error = %e, "deal refresh failed after message");
                    None
                })
                .unwrap_or(deal))
        })
        .await
    }

    /// Refreshes the deal list and the originating offer after a confirmed
    /// write. Refresh failures are logged; the write itself already landed.
    async fn after_deal_write(&self, market: &Market, deal: &Deal) -> Deal {
        let key = deal.offer_key();
        let (deals, ()) = tokio::join!(
            market.deals.fetch_and_set_deals(),
            self.refresh_offer(market, &key)
        );
        if let Err(e) = deals {
            tracing::warn!(deal = %deal.id, error = %e, "deal list refresh failed after write");
        }
        market.deals.deal(deal.id.as_str()).unwrap_or_else(|| deal.clone())
    }

    async fn refresh_offer(&self, market: &Market, key: &OfferKey) {
        if let Err(e) = market.offers.refresh_offer(key).await {
            tracing::warn!(maker = %key.maker, error = %e, "offer refresh failed after deal write");
        }
    }
}
