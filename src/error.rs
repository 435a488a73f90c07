use super::types::DealState;

/// Missing session preconditions. Raised before any ledger interaction.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No signer is connected")]
    NoSigner,
    #[error("No network client is available")]
    NoNetworkClient,
    #[error("Unsupported network: chain id {0}")]
    UnsupportedNetwork(u64),
    #[error("No ledger address is configured for chain id {0}")]
    MissingLedgerAddress(u64),
}

/// Input rejected locally; never reaches the ledger.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid {field}: {reason}")]
    InvalidAmount { field: &'static str, reason: String },
    #[error("Minimum {min} exceeds maximum {max}")]
    LimitsOutOfOrder { min: u128, max: u128 },
    #[error("Invalid payment methods: {0}")]
    InvalidPaymentMethods(String),
    #[error("Invalid requirements text: {0}")]
    InvalidTerms(String),
    #[error("Invalid country code {0:?}, expected two letters A-Z")]
    InvalidCountryCode(String),
    #[error("Invalid encoded country code {0:#x}")]
    InvalidCountryValue(u64),
    #[error("Invalid address {0:?}")]
    InvalidAddress(String),
    #[error("Token {0} is not configured for this network")]
    UnknownToken(String),
    #[error("{label} is required")]
    CommentRequired { label: &'static str },
    #[error("Deal is {actual}, expected {expected}")]
    WrongState {
        expected: DealState,
        actual: DealState,
    },
    #[error("{action} is not available to this party while the deal is {state}")]
    ActionNotAllowed {
        action: &'static str,
        state: DealState,
    },
    #[error("Message is empty")]
    EmptyMessage,
}

/// Failures reported by the ledger or the transport beneath it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The dry run refused the call under the ledger's own rules.
    #[error("Ledger refused the call: {0}")]
    Rule(String),
    /// The signer declined to authorize the call.
    #[error("{0}")]
    Declined(String),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed ledger response: {0}")]
    Malformed(String),
    #[error("Transaction {tx} reverted: {reason}")]
    Reverted { tx: String, reason: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("Deal {0} not found")]
    DealNotFound(String),
    #[error("Deal {0} has no ledger id yet")]
    DealNotConfirmed(String),
    #[error("Offer not found")]
    OfferNotFound,
    #[error("Account is not a party to deal {0}")]
    NotAParty(String),
}
