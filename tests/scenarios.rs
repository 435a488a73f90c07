//! End-to-end deal scenarios between a maker and a taker session
//!
//! Both sessions share one in-process ledger, so each sees the other's
//! confirmed writes only through ledger reads, as two browsers would.

use anyhow::Context;
use async_trait::async_trait;
use escrow_market::{
    MarketConfig, Orchestrator,
    cache::{Clock, SystemClock},
    classify::{self, ErrorClass},
    config::TokenConfig,
    error::{ConfigError, LedgerError, ValidationError},
    lifecycle::Action,
    ledger::{ReadCall, Receipt, Transport, TxHash, WriteCall, memory::MemoryLedger},
    types::{Address, DealState, Offer, Side, TokenInfo},
    validate::OfferForm,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

const MAKER: &str = "0x00000000000000000000000000000000000000aa";
const TAKER: &str = "0x00000000000000000000000000000000000000bb";
const TOKEN: &str = "0x00000000000000000000000000000000000000cc";
const LEDGER: &str = "0x00000000000000000000000000000000000000ee";

const UNIT: u128 = 1_000_000;

/// Forwards to the in-process ledger while counting writes. Can fail the
/// next read after a confirmed write, to exercise the re-read fallbacks.
struct Probe {
    inner: Arc<MemoryLedger>,
    writes: AtomicUsize,
    fail_read_after_write: AtomicBool,
}

#[async_trait]
impl Transport for Probe {
    async fn read(&self, call: &ReadCall) -> Result<Value, LedgerError> {
        self.inner.read(call).await
    }
    async fn simulate(&self, from: &Address, call: &WriteCall) -> Result<(), LedgerError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.simulate(from, call).await
    }
    async fn submit(&self, from: &Address, call: &WriteCall) -> Result<TxHash, LedgerError> {
        self.inner.submit(from, call).await
    }
    async fn confirm(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        let receipt = self.inner.confirm(tx).await?;
        if self.fail_read_after_write.swap(false, Ordering::SeqCst) {
            self.inner.fail_reads(1);
        }
        Ok(receipt)
    }
}

struct Session {
    ledger: Arc<MemoryLedger>,
    probe: Arc<Probe>,
    maker: Orchestrator,
    taker: Orchestrator,
}

fn config() -> MarketConfig {
    MarketConfig {
        ledger_addresses: HashMap::from([("42161".to_string(), LEDGER.to_string())]),
        tokens: vec![TokenConfig {
            address: TOKEN.to_string(),
            symbol: "USDT".to_string(),
            decimals: 6,
        }],
        ..Default::default()
    }
}

fn session() -> anyhow::Result<Session> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let ledger = Arc::new(MemoryLedger::new());
    let probe = Arc::new(Probe {
        inner: Arc::clone(&ledger),
        writes: AtomicUsize::new(0),
        fail_read_after_write: AtomicBool::new(false),
    });
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport: Arc<dyn Transport> = probe.clone();

    let maker = Orchestrator::new(&config(), Some(Arc::clone(&transport)), Arc::clone(&clock))?;
    maker.set_account(Some(Address::parse(MAKER)?));
    let taker = Orchestrator::new(&config(), Some(transport), clock)?;
    taker.set_account(Some(Address::parse(TAKER)?));

    Ok(Session {
        ledger,
        probe,
        maker,
        taker,
    })
}

fn sell_form() -> anyhow::Result<OfferForm> {
    Ok(OfferForm {
        token: TokenInfo {
            address: Address::parse(TOKEN)?,
            symbol: "USDT".to_string(),
            decimals: 6,
        },
        side: Side::Sell,
        fiat: "DE".to_string(),
        price: "1.005".to_string(),
        min: "10".to_string(),
        max: "500".to_string(),
        reserve: "1000".to_string(),
        methods: "SEPA, Wise".to_string(),
        terms: "Verified accounts only".to_string(),
    })
}

/// Publishes the maker's SELL offer and returns it as the taker sees it.
async fn listed_offer(s: &Session) -> anyhow::Result<Offer> {
    s.maker.set_online(true).await?;
    s.maker.create_offer(&sell_form()?).await?;

    // A taker buying sees makers selling.
    let offers = s.taker.ensure_market(Side::Buy, "DE", false).await?;
    offers
        .into_iter()
        .find(|o| o.maker.as_str() == MAKER)
        .context("maker's offer is not listed")
}

fn has_error<E: std::error::Error + PartialEq + 'static>(err: &anyhow::Error, expected: &E) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<E>() == Some(expected))
}

/// Scenario A: a SELL offer is requested, accepted, paid and released, after
/// which the deal sits in "recent" for both parties.
#[tokio::test]
async fn sell_offer_deal_runs_to_release() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;

    assert_eq!(offer.price, 1_005_000);
    assert_eq!(offer.min, 10 * UNIT);
    assert_eq!(offer.max, 500 * UNIT);
    assert_eq!(offer.methods, "SEPA, Wise");
    assert!(!offer.id.is_draft());

    let deal = s.taker.request_deal(&offer, "50", "sepa", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    assert_eq!(deal.state, DealState::Requested);
    assert_eq!(deal.amount, 50 * UNIT);
    assert_eq!(deal.price, 1_005_000);
    assert_eq!(deal.method, "SEPA");
    assert!(s.taker.open_deals().iter().any(|d| d.id.as_str() == id));
    assert_eq!(s.ledger.reserve_of(&offer.key()), Some(950 * UNIT));

    s.maker.ensure_deals(false).await?;
    let deal = s
        .maker
        .accept(&id, Some("  IBAN DE89 3704 0044 0532 0130 00  "))
        .await?;
    assert_eq!(deal.state, DealState::Accepted);
    assert_eq!(
        deal.notes.last().map(|n| n.text.as_str()),
        Some("IBAN DE89 3704 0044 0532 0130 00")
    );

    s.taker.ensure_deals(true).await?;
    let deal = s.taker.mark_paid(&id, None).await?;
    assert_eq!(deal.state, DealState::Paid);

    s.maker.ensure_deals(true).await?;
    let deal = s.maker.release(&id, None).await?;
    assert_eq!(deal.state, DealState::Released);

    s.taker.ensure_deals(true).await?;
    for party in [&s.maker, &s.taker] {
        assert!(party.open_deals().iter().all(|d| d.id.as_str() != id));
        assert!(party.recent_deals().iter().any(|d| d.id.as_str() == id));
    }
    let profile = s.taker.profile(&Address::parse(MAKER)?).await?;
    assert_eq!(profile.deals_completed, 1);
    Ok(())
}

/// Scenario B: the taker cancels before acceptance and the reserve comes back.
#[tokio::test]
async fn canceled_request_restores_reserve() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;

    let deal = s.taker.request_deal(&offer, "50", "Wise", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    assert_eq!(s.ledger.reserve_of(&offer.key()), Some(950 * UNIT));

    let deal = s.taker.cancel(&id, None).await?;
    assert_eq!(deal.state, DealState::Canceled);
    assert_eq!(s.ledger.reserve_of(&offer.key()), Some(1000 * UNIT));

    s.maker.ensure_deals(true).await?;
    for party in [&s.maker, &s.taker] {
        assert!(party.open_deals().is_empty());
        assert_eq!(party.recent_deals().len(), 1);
    }

    // The taker's view of the offer was refreshed after the cancel.
    let offers = s.taker.ensure_market(Side::Buy, "DE", false).await?;
    assert_eq!(offers[0].reserve, 1000 * UNIT);
    Ok(())
}

/// A required comment that is blank never reaches the ledger.
#[tokio::test]
async fn blank_payment_details_block_accept_locally() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    s.maker.ensure_deals(false).await?;

    let writes = s.probe.writes.load(Ordering::SeqCst);
    let err = s.maker.accept(&id, Some("   ")).await.unwrap_err();
    assert!(classify::needs_comment(&err));
    assert_eq!(classify::classify(&err), ErrorClass::Validation);
    assert_eq!(err.to_string(), "Payment details is required");
    assert_eq!(s.probe.writes.load(Ordering::SeqCst), writes);

    let deal = s.maker.accept(&id, Some("IBAN")).await?;
    assert_eq!(deal.state, DealState::Accepted);
    assert_eq!(s.probe.writes.load(Ordering::SeqCst), writes + 1);
    Ok(())
}

/// On a SELL offer both parties may still cancel once the deal is accepted.
#[tokio::test]
async fn accepted_sell_offer_deal_can_be_canceled() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    s.maker.ensure_deals(false).await?;
    s.maker.accept(&id, Some("IBAN")).await?;

    s.taker.ensure_deals(true).await?;
    let deal = s.taker.deal(&id).context("deal missing")?;
    let cell = s.taker.scenario(&deal).context("no scenario")?;
    assert_eq!(cell.primary, Some(Action::MarkPaid));
    assert_eq!(cell.secondary, Some(Action::Cancel));

    let deal = s.maker.cancel(&id, Some("buyer unresponsive")).await?;
    assert_eq!(deal.state, DealState::Canceled);
    assert_eq!(s.ledger.reserve_of(&offer.key()), Some(1000 * UNIT));
    Ok(())
}

/// On a BUY offer the maker pays fiat and the taker waits for it: once the
/// deal is accepted neither may cancel, and the refusal is local.
#[tokio::test]
async fn accepted_buy_offer_deal_cannot_be_canceled() -> anyhow::Result<()> {
    let s = session()?;
    s.maker.set_online(true).await?;
    let mut form = sell_form()?;
    form.side = Side::Buy;
    s.maker.create_offer(&form).await?;

    // A taker selling sees makers buying.
    let offer = s
        .taker
        .ensure_market(Side::Sell, "DE", false)
        .await?
        .into_iter()
        .next()
        .context("buy offer not listed")?;
    assert_eq!(offer.side, Side::Buy);

    // The selling taker has to say where to be paid.
    let err = s.taker.request_deal(&offer, "20", "SEPA", None).await.unwrap_err();
    assert!(classify::needs_comment(&err));
    let deal = s
        .taker
        .request_deal(&offer, "20", "SEPA", Some("IBAN DE02"))
        .await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();

    s.maker.ensure_deals(false).await?;
    s.maker.accept(&id, None).await?;
    s.taker.ensure_deals(true).await?;

    let writes = s.probe.writes.load(Ordering::SeqCst);
    let refused = ValidationError::ActionNotAllowed {
        action: "Cancel",
        state: DealState::Accepted,
    };
    for party in [&s.maker, &s.taker] {
        let err = party.cancel(&id, None).await.unwrap_err();
        assert!(has_error(&err, &refused));
    }
    assert_eq!(s.probe.writes.load(Ordering::SeqCst), writes);

    let deal = s.maker.mark_paid(&id, None).await?;
    assert_eq!(deal.state, DealState::Paid);
    s.taker.ensure_deals(true).await?;
    let deal = s.taker.release(&id, None).await?;
    assert_eq!(deal.state, DealState::Released);
    Ok(())
}

/// Release before payment fails locally with the expected state.
#[tokio::test]
async fn release_requires_paid() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    s.maker.ensure_deals(false).await?;

    let err = s.maker.release(&id, None).await.unwrap_err();
    assert!(has_error(
        &err,
        &ValidationError::WrongState {
            expected: DealState::Paid,
            actual: DealState::Requested,
        }
    ));
    Ok(())
}

/// Missing session pieces are reported before anything is sent.
#[tokio::test]
async fn missing_context_fails_fast() -> anyhow::Result<()> {
    let s = session()?;
    s.taker.set_account(None);
    let err = s.taker.cancel("0x01", None).await.unwrap_err();
    assert!(has_error(&err, &ConfigError::NoSigner));
    assert_eq!(classify::classify(&err), ErrorClass::Config);

    let offline = Orchestrator::new(&config(), None, Arc::new(SystemClock))?;
    offline.set_account(Some(Address::parse(TAKER)?));
    let err = offline.ensure_deals(false).await.unwrap_err();
    assert!(has_error(&err, &ConfigError::NoNetworkClient));

    let wrong_chain = MarketConfig {
        chain_id: 1,
        ..config()
    };
    let transport: Arc<dyn Transport> = s.probe.clone();
    let elsewhere = Orchestrator::new(&wrong_chain, Some(transport), Arc::new(SystemClock))?;
    elsewhere.set_account(Some(Address::parse(TAKER)?));
    let err = elsewhere.set_online(true).await.unwrap_err();
    assert!(has_error(&err, &ConfigError::UnsupportedNetwork(1)));
    assert_eq!(s.probe.writes.load(Ordering::SeqCst), 0);
    Ok(())
}

/// A declined signature is classified apart and leaves the caches untouched.
#[tokio::test]
async fn declined_signature_is_not_a_fault() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.decline_signatures(true);
    let generation = s.maker.offers_generation();

    let err = s.maker.set_online(true).await.unwrap_err();
    assert_eq!(classify::classify(&err), ErrorClass::Declined);
    assert!(!classify::classify(&err).is_fault());
    assert_eq!(err.to_string(), "Request declined in wallet.");
    assert_eq!(s.maker.offers_generation(), generation);
    Ok(())
}

/// The ledger refuses a request priced from a stale view.
#[tokio::test]
async fn stale_price_is_refused_by_the_ledger() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;

    let mut repriced = sell_form()?;
    repriced.price = "1.010".to_string();
    s.maker.update_offer(&repriced).await?;

    let err = s.taker.request_deal(&offer, "20", "SEPA", None).await.unwrap_err();
    assert_eq!(classify::classify(&err), ErrorClass::Rule);
    assert_eq!(err.to_string(), "Ledger refused the call: stale price");
    assert!(s.taker.deals().is_empty());
    Ok(())
}

/// A failed re-read after publishing leaves a local copy in place until the
/// next fetch shows the real offer.
#[tokio::test]
async fn offer_falls_back_to_local_copy() -> anyhow::Result<()> {
    let s = session()?;
    s.maker.set_online(true).await?;

    s.probe.fail_read_after_write.store(true, Ordering::SeqCst);
    let offer = s.maker.create_offer(&sell_form()?).await?;
    assert!(offer.id.is_draft());
    assert_eq!(offer.price, 1_005_000);
    assert_eq!(s.maker.own_offers().len(), 1);

    // Makers selling are what a buyer browses.
    let listed = s.maker.ensure_market(Side::Buy, "DE", true).await?;
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].id.is_draft());
    assert!(s.maker.own_offers().iter().all(|o| !o.id.is_draft()));
    Ok(())
}

/// Without an id preview the new deal is still found by elimination.
#[tokio::test]
async fn request_matched_without_preview() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.preview_ids(false);
    let offer = listed_offer(&s).await?;

    let deal = s.taker.request_deal(&offer, "20", "SEPA", Some("hello")).await?;
    assert!(deal.ledger_id().is_some());
    assert_eq!(s.taker.deals().len(), 1);
    Ok(())
}

/// If the deal list cannot be read after a request, a local row stands in.
#[tokio::test]
async fn request_falls_back_to_local_row() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    s.taker.ensure_deals(false).await?;

    s.probe.fail_read_after_write.store(true, Ordering::SeqCst);
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    assert!(deal.id.is_draft());
    assert_eq!(deal.state, DealState::Requested);

    // Local rows cannot be acted on.
    let err = s.taker.cancel(deal.id.as_str(), None).await.unwrap_err();
    assert_eq!(classify::classify(&err), ErrorClass::Validation);
    // The cause already reads as the user message, so it is not repeated.
    assert_eq!(format!("{err:#}"), err.to_string());

    let deals = s.taker.ensure_deals(true).await?;
    assert_eq!(deals.len(), 1);
    assert!(deals[0].ledger_id().is_some());
    Ok(())
}

/// Without an id preview and without a re-read, the local row is settled
/// by elimination on the next fetch instead of lingering beside the real one.
#[tokio::test]
async fn local_row_settled_without_preview() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.preview_ids(false);
    let offer = listed_offer(&s).await?;
    s.taker.ensure_deals(false).await?;

    s.probe.fail_read_after_write.store(true, Ordering::SeqCst);
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    assert!(deal.id.is_draft());
    assert_eq!(s.taker.open_deals().len(), 1);

    let deals = s.taker.ensure_deals(true).await?;
    assert_eq!(deals.len(), 1);
    assert!(deals[0].ledger_id().is_some());
    assert_eq!(deals[0].state, DealState::Requested);
    assert_eq!(s.taker.open_deals().len(), 1);
    Ok(())
}

/// When more new deals show up for the offer than requests are waiting, the
/// local rows go and every confirmed deal stays listed.
#[tokio::test]
async fn ambiguous_new_deals_still_settle_local_rows() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.preview_ids(false);
    let offer = listed_offer(&s).await?;
    s.taker.ensure_deals(false).await?;

    s.probe.fail_read_after_write.store(true, Ordering::SeqCst);
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    assert!(deal.id.is_draft());

    // The same account requests again from another session.
    s.ledger.apply_external(
        &Address::parse(TAKER)?,
        &WriteCall::RequestDeal {
            offer: offer.key(),
            amount: 30 * UNIT,
            price: offer.price,
            method: "Wise".to_string(),
            note: None,
        },
    )?;

    let deals = s.taker.ensure_deals(true).await?;
    assert_eq!(deals.len(), 2);
    assert!(deals.iter().all(|d| d.ledger_id().is_some()));
    Ok(())
}

/// Two requests whose re-reads both failed are settled together once both
/// deals are visible.
#[tokio::test]
async fn repeated_requests_settle_together() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.preview_ids(false);
    let offer = listed_offer(&s).await?;
    s.taker.ensure_deals(false).await?;

    for amount in ["20", "30"] {
        s.probe.fail_read_after_write.store(true, Ordering::SeqCst);
        let deal = s.taker.request_deal(&offer, amount, "SEPA", None).await?;
        assert!(deal.id.is_draft());
    }
    assert_eq!(s.taker.deals().len(), 2);

    let deals = s.taker.ensure_deals(true).await?;
    assert_eq!(deals.len(), 2);
    assert!(deals.iter().all(|d| d.ledger_id().is_some()));
    Ok(())
}

/// Offers for a token the network does not list never reach the ledger.
#[tokio::test]
async fn offer_for_unlisted_token_is_refused() -> anyhow::Result<()> {
    let s = session()?;
    let mut form = sell_form()?;
    form.token.address = Address::parse("0x00000000000000000000000000000000000000dd")?;

    let writes = s.probe.writes.load(Ordering::SeqCst);
    let err = s.maker.create_offer(&form).await.unwrap_err();
    assert!(has_error(
        &err,
        &ValidationError::UnknownToken(form.token.address.to_string())
    ));
    assert_eq!(classify::classify(&err), ErrorClass::Validation);
    assert_eq!(s.probe.writes.load(Ordering::SeqCst), writes);
    Ok(())
}

/// Offline makers are hidden only when the ledger reports presence.
#[tokio::test]
async fn offline_makers_hidden_when_reported() -> anyhow::Result<()> {
    let s = session()?;
    listed_offer(&s).await?;
    s.maker.set_online(false).await?;

    assert!(s.taker.ensure_market(Side::Buy, "DE", true).await?.is_empty());

    s.ledger.report_presence(false);
    assert_eq!(s.taker.ensure_market(Side::Buy, "DE", true).await?.len(), 1);
    Ok(())
}

/// Positional responses decode to the same records as keyed ones.
#[tokio::test]
async fn tuple_responses_run_the_same_flow() -> anyhow::Result<()> {
    let s = session()?;
    s.ledger.use_tuple_shape(true);
    let offer = listed_offer(&s).await?;
    assert_eq!(offer.price, 1_005_000);
    assert_eq!(offer.fiat.country(), "DE");

    let deal = s.taker.request_deal(&offer, "50", "Wise", None).await?;
    assert_eq!(deal.fiat_label, "EUR (Germany)");
    assert_eq!(deal.partner.as_str(), MAKER);
    Ok(())
}

/// Chat notes are tagged with the state they were posted in.
#[tokio::test]
async fn messages_are_appended_to_open_deals() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    let deal = s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();

    assert!(s.taker.send_message(&id, "  ").await.is_err());
    let deal = s.taker.send_message(&id, "Sending in 5 minutes").await?;
    let note = deal.notes.last().context("no note")?;
    assert_eq!(note.text, "Sending in 5 minutes");
    assert_eq!(note.state, DealState::Requested);
    assert!(!note.from_maker);
    Ok(())
}

/// Switching accounts drops the previous account's deals.
#[tokio::test]
async fn account_switch_tears_down_deal_view() -> anyhow::Result<()> {
    let s = session()?;
    let offer = listed_offer(&s).await?;
    s.taker.request_deal(&offer, "20", "SEPA", None).await?;
    assert_eq!(s.taker.deals().len(), 1);

    s.taker
        .set_account(Some(Address::parse("0x00000000000000000000000000000000000000dd")?));
    assert!(s.taker.deals().is_empty());
    assert!(s.taker.ensure_deals(false).await?.is_empty());
    Ok(())
}

/// The exact wallet message classifies as declined; a rule message does not.
#[test]
fn declined_message_classification() {
    let declined = anyhow::anyhow!(escrow_market::ledger::memory::DECLINED_MESSAGE);
    assert_eq!(classify::classify(&declined), ErrorClass::Declined);

    let reserve = anyhow::anyhow!("insufficient reserve");
    assert_ne!(classify::classify(&reserve), ErrorClass::Declined);
}
