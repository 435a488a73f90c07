//! Decoding of raw ledger responses
//!
//! The ledger protocol answers either with positional tuples or with keyed
//! objects, depending on the node and protocol revision. Each record type has
//! one decoder that accepts both shapes.
use crate::error::LedgerError;
use crate::fiat::{self, FiatCode};
use crate::types::{
    Address, ChatNote, Deal, DealState, EntryId, MakerProfile, Offer, Side, TimeStamp, TokenInfo,
};
use serde_json::Value;

fn malformed(what: impl Into<String>) -> LedgerError {
    LedgerError::Malformed(what.into())
}

fn field<'a>(raw: &'a Value, name: &str, index: usize) -> Option<&'a Value> {
    match raw {
        Value::Object(map) => map.get(name),
        Value::Array(items) => items.get(index),
        _ => None,
    }
    .filter(|v| !v.is_null())
}

fn required<'a>(raw: &'a Value, name: &str, index: usize) -> Result<&'a Value, LedgerError> {
    field(raw, name, index).ok_or_else(|| malformed(format!("missing field {name}")))
}

fn as_u128(raw: &Value, name: &str) -> Result<u128, LedgerError> {
    match raw {
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| malformed(format!("{name} is not an unsigned integer"))),
        Value::String(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u128::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| malformed(format!("{name} is not an unsigned integer")))
        }
        _ => Err(malformed(format!("{name} is not an unsigned integer"))),
    }
}

fn as_u64(raw: &Value, name: &str) -> Result<u64, LedgerError> {
    u64::try_from(as_u128(raw, name)?).map_err(|_| malformed(format!("{name} overflows")))
}

fn as_bool(raw: &Value, name: &str) -> Result<bool, LedgerError> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::Number(_) | Value::String(_) => Ok(as_u128(raw, name)? != 0),
        _ => Err(malformed(format!("{name} is not a boolean"))),
    }
}

fn as_text(raw: Option<&Value>) -> String {
    raw.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn as_address(raw: &Value, name: &str) -> Result<Address, LedgerError> {
    raw.as_str()
        .and_then(|s| Address::parse(s).ok())
        .ok_or_else(|| malformed(format!("{name} is not an address")))
}

fn as_side(raw: &Value) -> Result<Side, LedgerError> {
    Side::from_ledger(as_u64(raw, "side")?).ok_or_else(|| malformed("unknown side"))
}

fn as_fiat(raw: &Value) -> Result<FiatCode, LedgerError> {
    FiatCode::from_raw(as_u64(raw, "fiat")?).map_err(|e| malformed(e.to_string()))
}

/// Canonical `0x`-prefixed, 32-byte hex deal id from a number or a hex string.
pub fn deal_id(raw: &Value) -> Result<String, LedgerError> {
    let bytes = match raw {
        Value::Number(n) => n
            .as_u64()
            .map(|v| v.to_be_bytes().to_vec())
            .ok_or_else(|| malformed("deal id is not an unsigned integer"))?,
        Value::String(s) => {
            let body = s.strip_prefix("0x").unwrap_or(s);
            let body = if body.len() % 2 == 1 {
                format!("0{body}")
            } else {
                body.to_string()
            };
            hex::decode(&body).map_err(|_| malformed("deal id is not hex"))?
        }
        _ => return Err(malformed("deal id is not a number or hex string")),
    };
    if bytes.len() > 32 {
        return Err(malformed("deal id exceeds 32 bytes"));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(format!("0x{}", hex::encode(padded)))
}

/// Decodes one offer. An empty slot (null, or a zero maker) decodes to `None`.
pub fn offer<F>(raw: &Value, token_info: F) -> Result<Option<Offer>, LedgerError>
where
    F: Fn(&Address) -> TokenInfo,
{
    if raw.is_null() {
        return Ok(None);
    }
    let maker = as_address(required(raw, "maker", 0)?, "maker")?;
    if maker.is_zero() {
        return Ok(None);
    }
    let token = as_address(required(raw, "token", 1)?, "token")?;
    let side = as_side(required(raw, "side", 2)?)?;
    let fiat = as_fiat(required(raw, "fiat", 3)?)?;

    let mut offer = Offer {
        id: EntryId::Ledger(String::new()),
        maker,
        side,
        token: token_info(&token),
        fiat,
        price: as_u64(required(raw, "price", 4)?, "price")?,
        min: as_u128(required(raw, "min", 5)?, "min")?,
        max: as_u128(required(raw, "max", 6)?, "max")?,
        reserve: as_u128(required(raw, "reserve", 7)?, "reserve")?,
        methods: as_text(field(raw, "methods", 8)),
        terms: as_text(field(raw, "terms", 9)),
        updated_at: TimeStamp::from_unix(as_u64(required(raw, "updatedAt", 10)?, "updatedAt")? as i64),
        online: field(raw, "online", 11)
            .map(|v| as_bool(v, "online"))
            .transpose()?,
    };

    let id = match field(raw, "id", usize::MAX).and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => offer
            .key()
            .digest()
            .map_err(|e| malformed(format!("offer key: {e}")))?,
    };
    offer.id = EntryId::Ledger(id);
    Ok(Some(offer))
}

/// A page of raw items plus the offset of the next page, if any.
pub fn page(raw: &Value) -> Result<(Vec<Value>, Option<u64>), LedgerError> {
    let items = required(raw, "items", 0)?
        .as_array()
        .cloned()
        .ok_or_else(|| malformed("page items is not a list"))?;
    let next = field(raw, "next", 1)
        .map(|v| as_u64(v, "next"))
        .transpose()?;
    Ok((items, next))
}

fn note(raw: &Value) -> Result<ChatNote, LedgerError> {
    Ok(ChatNote {
        at: TimeStamp::from_unix(as_u64(required(raw, "at", 0)?, "at")? as i64),
        state: DealState::from_ledger(as_u64(required(raw, "state", 1)?, "state")?)
            .ok_or_else(|| malformed("unknown note state"))?,
        from_maker: as_bool(required(raw, "fromMaker", 2)?, "fromMaker")?,
        text: as_text(field(raw, "text", 3)),
    })
}

/// Decodes one deal as seen by `viewer`, who determines the partner address.
pub fn deal<F>(raw: &Value, viewer: &Address, token_info: F) -> Result<Deal, LedgerError>
where
    F: Fn(&Address) -> TokenInfo,
{
    let id = deal_id(required(raw, "id", 0)?)?;
    let token = as_address(required(raw, "token", 1)?, "token")?;
    let side = as_side(required(raw, "side", 2)?)?;
    let fiat = as_fiat(required(raw, "fiat", 3)?)?;
    let maker = as_address(required(raw, "maker", 4)?, "maker")?;
    let taker = as_address(required(raw, "taker", 5)?, "taker")?;
    let state = DealState::from_ledger(as_u64(required(raw, "state", 8)?, "state")?)
        .ok_or_else(|| malformed("unknown deal state"))?;

    let notes = match field(raw, "notes", 11) {
        Some(Value::Array(items)) => items.iter().map(note).collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(malformed("notes is not a list")),
        None => Vec::new(),
    };

    let partner = if *viewer == maker {
        taker.clone()
    } else {
        maker.clone()
    };

    Ok(Deal {
        id: EntryId::Ledger(id),
        side,
        token: token_info(&token),
        amount: as_u128(required(raw, "amount", 6)?, "amount")?,
        price: as_u64(required(raw, "price", 7)?, "price")?,
        fiat,
        fiat_label: fiat::label(fiat),
        maker,
        taker,
        partner,
        state,
        method: as_text(field(raw, "method", 9)),
        notes,
        updated_at: TimeStamp::from_unix(as_u64(required(raw, "updatedAt", 10)?, "updatedAt")? as i64),
    })
}

pub fn deals<F>(raw: &Value, viewer: &Address, token_info: F) -> Result<Vec<Deal>, LedgerError>
where
    F: Fn(&Address) -> TokenInfo,
{
    let items = match raw {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("deals")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed("deal list missing"))?,
        Value::Null => return Ok(Vec::new()),
        _ => return Err(malformed("deal list is not a list")),
    };
    items
        .iter()
        .map(|item| deal(item, viewer, &token_info))
        .collect()
}

pub fn profile(raw: &Value) -> Result<MakerProfile, LedgerError> {
    if raw.is_null() {
        return Ok(MakerProfile::default());
    }
    Ok(MakerProfile {
        online: field(raw, "online", 0)
            .map(|v| as_bool(v, "online"))
            .transpose()?
            .unwrap_or(false),
        nickname: as_text(field(raw, "nickname", 1)),
        deals_completed: field(raw, "dealsCompleted", 2)
            .map(|v| as_u64(v, "dealsCompleted"))
            .transpose()?
            .unwrap_or(0),
        deals_canceled: field(raw, "dealsCanceled", 3)
            .map(|v| as_u64(v, "dealsCanceled"))
            .transpose()?
            .unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAKER: &str = "0x00000000000000000000000000000000000000aa";
    const TAKER: &str = "0x00000000000000000000000000000000000000bb";
    const TOKEN: &str = "0x00000000000000000000000000000000000000cc";

    fn token(address: &Address) -> TokenInfo {
        TokenInfo {
            address: address.clone(),
            symbol: "USDT".into(),
            decimals: 6,
        }
    }

    #[test]
    fn offer_decodes_from_both_shapes() {
        let keyed = json!({
            "maker": MAKER, "token": TOKEN, "side": 1, "fiat": 0x5553,
            "price": "1005000", "min": 10, "max": 500, "reserve": 1000,
            "methods": "SEPA, Wise", "terms": "", "updatedAt": 1_700_000_000u64,
        });
        let tuple = json!([
            MAKER, TOKEN, 1, 0x5553, 1005000, "10", "500", "1000", "SEPA, Wise", "", 1_700_000_000u64
        ]);

        let a = offer(&keyed, token).unwrap().unwrap();
        let b = offer(&tuple, token).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.price, 1_005_000);
        assert_eq!(a.online, None);
    }

    #[test]
    fn empty_offer_slot_is_none() {
        let empty = json!([Address::ZERO, TOKEN, 0, 0x5553, 0, 0, 0, 0, "", "", 0]);
        assert_eq!(offer(&empty, token).unwrap(), None);
        assert_eq!(offer(&Value::Null, token).unwrap(), None);
    }

    #[test]
    fn deal_partner_is_relative_to_viewer() {
        let raw = json!({
            "id": 7, "token": TOKEN, "side": 1, "fiat": 0x4742, "maker": MAKER, "taker": TAKER,
            "amount": "50", "price": 1005000, "state": 0, "method": "SEPA", "updatedAt": 5,
            "notes": [[4, 0, false, "hello"]],
        });
        let maker = Address::parse(MAKER).unwrap();
        let taker = Address::parse(TAKER).unwrap();

        let seen_by_maker = deal(&raw, &maker, token).unwrap();
        let seen_by_taker = deal(&raw, &taker, token).unwrap();
        assert_eq!(seen_by_maker.partner, taker);
        assert_eq!(seen_by_taker.partner, maker);
        assert_eq!(seen_by_maker.fiat_label, "GBP (United Kingdom)");
        assert_eq!(seen_by_maker.notes.len(), 1);
        assert_eq!(
            seen_by_maker.id.as_str(),
            "0x0000000000000000000000000000000000000000000000000000000000000007"
        );
    }

    #[test]
    fn deal_ids_are_canonical_hex() {
        assert_eq!(deal_id(&json!("0x7")).unwrap(), deal_id(&json!(7)).unwrap());
        assert!(deal_id(&json!("zz")).is_err());
    }
}
