//! Market configuration
use super::error::{ConfigError, ValidationError};
use super::fiat::{self, FiatCode};
use super::types::{Address, TokenInfo};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Chain the session connects to.
    pub chain_id: u64,
    pub supported_chains: Vec<u64>,
    /// Escrow ledger contract keyed by decimal chain id.
    pub ledger_addresses: HashMap<String, String>,
    pub tokens: Vec<TokenConfig>,
    /// Fiat market used when a requested code is unknown.
    pub default_fiat: String,
    pub cache_ttl_secs: u64,
    pub offer_page_size: usize,
    pub storage_namespace: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            chain_id: 42161,
            supported_chains: vec![42161, 421614],
            ledger_addresses: HashMap::new(),
            tokens: Vec::new(),
            default_fiat: "US".to_string(),
            cache_ttl_secs: 60,
            offer_page_size: 100,
            storage_namespace: "escrow-market".to_string(),
        }
    }
}

impl MarketConfig {
    /// Layers an optional config file and `ESCROW__*` environment variables over the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let config = builder
            .add_source(::config::Environment::with_prefix("ESCROW").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_fiat(&self) -> FiatCode {
        FiatCode::parse(&self.default_fiat.to_ascii_uppercase()).unwrap_or(fiat::DEFAULT_FIAT)
    }

    /// Ledger address for the configured chain, checked against the supported set.
    pub fn ledger_address(&self) -> Result<Address, ConfigError> {
        if !self.supported_chains.contains(&self.chain_id) {
            return Err(ConfigError::UnsupportedNetwork(self.chain_id));
        }
        self.ledger_addresses
            .get(&self.chain_id.to_string())
            .and_then(|a| Address::parse(a).ok())
            .ok_or(ConfigError::MissingLedgerAddress(self.chain_id))
    }

    pub fn token_infos(&self) -> Result<Vec<TokenInfo>, ValidationError> {
        self.tokens
            .iter()
            .map(|t| {
                Ok(TokenInfo {
                    address: Address::parse(&t.address)?,
                    symbol: t.symbol.clone(),
                    decimals: t.decimals,
                })
            })
            .collect()
    }
}
