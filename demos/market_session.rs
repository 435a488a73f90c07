//! A maker and a taker trading through the in-process ledger
//!
//! Run with `RUST_LOG=escrow_market=debug` to watch cache swaps and writes.
use anyhow::Context;
use escrow_market::{
    MarketConfig, Orchestrator, amount,
    cache::{Clock, SystemClock},
    config::TokenConfig,
    ledger::{Transport, memory::MemoryLedger},
    types::{Address, Side},
    validate::OfferForm,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const MAKER: &str = "0x1111111111111111111111111111111111111111";
const TAKER: &str = "0x2222222222222222222222222222222222222222";
const TOKEN: &str = "0xfd086bc7cd5c481dcc9c85ebe478a1c0b69fcbb9";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = MarketConfig::load(None)?;
    config.ledger_addresses.insert(
        config.chain_id.to_string(),
        "0x3333333333333333333333333333333333333333".to_string(),
    );
    config.tokens = vec![TokenConfig {
        address: TOKEN.to_string(),
        symbol: "USDT".to_string(),
        decimals: 6,
    }];

    let ledger: Arc<dyn Transport> = Arc::new(MemoryLedger::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let maker = Orchestrator::new(&config, Some(Arc::clone(&ledger)), Arc::clone(&clock))?;
    maker.set_account(Some(Address::parse(MAKER)?));
    let taker = Orchestrator::new(&config, Some(ledger), clock)?;
    taker.set_account(Some(Address::parse(TAKER)?));

    let token = config.token_infos()?.remove(0);
    maker.set_online(true).await?;
    maker
        .create_offer(&OfferForm {
            token,
            side: Side::Sell,
            fiat: "DE".to_string(),
            price: "1.005".to_string(),
            min: "10".to_string(),
            max: "500".to_string(),
            reserve: "1000".to_string(),
            methods: "SEPA, Wise".to_string(),
            terms: String::new(),
        })
        .await?;

    let offers = taker.ensure_market(Side::Buy, "de", false).await?;
    let offer = offers.first().context("no offers listed")?;
    println!(
        "{} sells {} at {} {} per token",
        offer.maker,
        offer.token.symbol,
        amount::format_price(offer.price),
        offer.fiat
    );

    let deal = taker.request_deal(offer, "50", "SEPA", None).await?;
    let id = deal.ledger_id().context("request not confirmed")?.to_string();
    let total = amount::fiat_value(deal.amount, deal.token.decimals, deal.price)
        .map(|v| amount::format_units(v, amount::PRICE_DECIMALS))
        .unwrap_or_default();
    println!("requested deal {id} worth {total} {}", deal.fiat_label);

    maker.ensure_deals(false).await?;
    maker.accept(&id, Some("IBAN DE89 3704 0044 0532 0130 00")).await?;
    taker.ensure_deals(true).await?;
    taker.mark_paid(&id, None).await?;
    maker.ensure_deals(true).await?;
    let deal = maker.release(&id, None).await?;

    for note in &deal.notes {
        let from = if note.from_maker { "maker" } else { "taker" };
        println!("[{}] {from}: {}", note.state, note.text);
    }
    println!("deal {id} is {}", deal.state);
    Ok(())
}
