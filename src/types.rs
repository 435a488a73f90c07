//! Core marketplace records: offers, deals and the identifiers they share
use super::error::ValidationError;
use super::fiat::FiatCode;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
            .unwrap_or_else(Self::epoch)
    }
    pub fn epoch() -> Self {
        Self(DateTime::UNIX_EPOCH)
    }
    /// Ledger timestamps are unix seconds; anything out of chrono's range maps to the epoch.
    pub fn from_unix(secs: i64) -> Self {
        DateTime::from_timestamp(secs, 0)
            .map(Self)
            .unwrap_or_else(Self::epoch)
    }
    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus(&self, elapsed: chrono::Duration) -> Self {
        Self(self.0 + elapsed)
    }
    pub fn since(&self, earlier: &TimeStamp) -> chrono::Duration {
        self.0 - earlier.0
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::epoch()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.i64(self.0.timestamp())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let secs = d.i64()?;

        DateTime::from_timestamp(secs, 0)
            .map(TimeStamp)
            .ok_or(minicbor::decode::Error::message(
                "failed to convert timestamp to utc",
            ))
    }
}

/// A 20-byte account or contract address, held as lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub const ZERO: &'static str = "0x0000000000000000000000000000000000000000";

    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| ValidationError::InvalidAddress(text.to_string()))?;

        match hex::decode(body) {
            Ok(bytes) if bytes.len() == 20 => Ok(Self(format!("0x{}", hex::encode(bytes)))),
            _ => Err(ValidationError::InvalidAddress(text.to_string())),
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<C> minicbor::Encode<C> for Address {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Address {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;
        Address::parse(text).map_err(|_| minicbor::decode::Error::message("malformed address"))
    }
}

/// Side of an offer, always from the maker's perspective unless stated otherwise.
#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
)]
pub enum Side {
    #[n(0)]
    Buy,
    #[n(1)]
    Sell,
}

impl Side {
    pub fn inverse(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
    pub fn from_ledger(raw: u64) -> Option<Side> {
        match raw {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }
    pub fn to_ledger(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DealState {
    /// Client-only: the taker is composing a request that has not been submitted.
    New,
    Requested,
    Accepted,
    Paid,
    Released,
    Canceled,
}

impl DealState {
    pub const ALL: [DealState; 6] = [
        DealState::New,
        DealState::Requested,
        DealState::Accepted,
        DealState::Paid,
        DealState::Released,
        DealState::Canceled,
    ];

    pub fn from_ledger(raw: u64) -> Option<DealState> {
        match raw {
            0 => Some(DealState::Requested),
            1 => Some(DealState::Accepted),
            2 => Some(DealState::Paid),
            3 => Some(DealState::Released),
            4 => Some(DealState::Canceled),
            _ => None,
        }
    }
    pub fn to_ledger(self) -> Option<u8> {
        match self {
            DealState::New => None,
            DealState::Requested => Some(0),
            DealState::Accepted => Some(1),
            DealState::Paid => Some(2),
            DealState::Released => Some(3),
            DealState::Canceled => Some(4),
        }
    }
    pub fn is_terminal(self) -> bool {
        matches!(self, DealState::Released | DealState::Canceled)
    }
    pub fn is_open(self) -> bool {
        matches!(
            self,
            DealState::Requested | DealState::Accepted | DealState::Paid
        )
    }
    /// Transitions only move forward along the timeline, plus the cancel branch
    /// out of REQUESTED or ACCEPTED.
    pub fn can_transition_to(self, next: DealState) -> bool {
        match (self, next) {
            (DealState::New, DealState::Requested) => true,
            (DealState::Requested, DealState::Accepted) => true,
            (DealState::Accepted, DealState::Paid) => true,
            (DealState::Paid, DealState::Released) => true,
            (DealState::Requested | DealState::Accepted, DealState::Canceled) => true,
            _ => false,
        }
    }
    /// Steps shown on the progress timeline. NEW and CANCELED never appear.
    pub fn timeline() -> [DealState; 4] {
        [
            DealState::Requested,
            DealState::Accepted,
            DealState::Paid,
            DealState::Released,
        ]
    }
    pub fn progress(self) -> Option<usize> {
        Self::timeline().iter().position(|s| *s == self)
    }
    pub fn label(self) -> &'static str {
        match self {
            DealState::New => "New",
            DealState::Requested => "Requested",
            DealState::Accepted => "Accepted",
            DealState::Paid => "Paid",
            DealState::Released => "Released",
            DealState::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for DealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of an offer or deal: either assigned by the ledger or a local placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryId {
    Ledger(String),
    Draft(String),
}

impl EntryId {
    pub fn ledger_id(&self) -> Option<&str> {
        match self {
            EntryId::Ledger(id) => Some(id),
            EntryId::Draft(_) => None,
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            EntryId::Ledger(id) | EntryId::Draft(id) => id,
        }
    }
    pub fn is_draft(&self) -> bool {
        matches!(self, EntryId::Draft(_))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Natural key of an offer: one active offer per maker per market.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferKey {
    #[n(0)]
    pub token: Address,
    #[n(1)]
    pub maker: Address,
    #[n(2)]
    pub side: Side,
    #[n(3)]
    pub fiat: FiatCode,
}

impl OfferKey {
    /// Content digest of the key, used as the offer id when the ledger supplies none.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }
    pub fn market(&self) -> MarketKey {
        MarketKey {
            token: self.token.clone(),
            side: self.side,
            fiat: self.fiat,
        }
    }
}

/// One cache bucket: offers for a token, maker side and fiat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketKey {
    pub token: Address,
    pub side: Side,
    pub fiat: FiatCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub id: EntryId,
    pub maker: Address,
    pub side: Side,
    pub token: TokenInfo,
    pub fiat: FiatCode,
    /// Fiat per whole token, scaled by [`crate::amount::PRICE_SCALE`].
    pub price: u64,
    pub min: u128,
    pub max: u128,
    /// Remaining tradeable capacity behind the offer.
    pub reserve: u128,
    pub methods: String,
    pub terms: String,
    pub updated_at: TimeStamp,
    /// `None` when the ledger response predates the presence flag.
    pub online: Option<bool>,
}

impl Offer {
    pub fn key(&self) -> OfferKey {
        OfferKey {
            token: self.token.address.clone(),
            maker: self.maker.clone(),
            side: self.side,
            fiat: self.fiat,
        }
    }
    pub fn payment_methods(&self) -> impl Iterator<Item = &str> {
        self.methods.split(',').map(str::trim).filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatNote {
    pub at: TimeStamp,
    /// Deal state when the note was posted.
    pub state: DealState,
    pub from_maker: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    pub id: EntryId,
    pub side: Side,
    pub token: TokenInfo,
    pub amount: u128,
    pub price: u64,
    pub fiat: FiatCode,
    pub fiat_label: String,
    pub maker: Address,
    pub taker: Address,
    /// The counterpart relative to the account that fetched the deal.
    pub partner: Address,
    pub state: DealState,
    pub method: String,
    pub notes: Vec<ChatNote>,
    pub updated_at: TimeStamp,
}

impl Deal {
    pub fn offer_key(&self) -> OfferKey {
        OfferKey {
            token: self.token.address.clone(),
            maker: self.maker.clone(),
            side: self.side,
            fiat: self.fiat,
        }
    }
    pub fn role_of(&self, account: &Address) -> Option<Role> {
        if *account == self.maker {
            Some(Role::Maker)
        } else if *account == self.taker {
            Some(Role::Taker)
        } else {
            None
        }
    }
    pub fn ledger_id(&self) -> Option<&str> {
        self.id.ledger_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MakerProfile {
    pub online: bool,
    pub nickname: String,
    pub deals_completed: u64,
    pub deals_canceled: u64,
}
