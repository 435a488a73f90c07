//! Fixed-point amounts and prices
//!
//! Token amounts are integers scaled by the token's decimals. Prices are fiat
//! per whole token scaled by [`PRICE_SCALE`].
use super::error::ValidationError;

pub const PRICE_SCALE: u64 = 1_000_000;
pub const PRICE_DECIMALS: u8 = 6;

/// Parses a decimal string such as `"12.5"` into integer units.
pub fn parse_units(
    field: &'static str,
    text: &str,
    decimals: u8,
) -> Result<u128, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidAmount {
        field,
        reason: reason.to_string(),
    };
    let text = text.trim();
    if text.is_empty() {
        return Err(invalid("value is empty"));
    }

    let (whole, frac) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("value is empty"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid("only digits and one decimal point are allowed"));
    }
    if frac.len() > decimals as usize {
        return Err(invalid(&format!("at most {decimals} decimal places")));
    }

    let scale = 10u128
        .checked_pow(decimals as u32)
        .ok_or_else(|| invalid("unsupported precision"))?;
    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid("value is too large"))?
    };
    let frac_units: u128 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<width$}", width = decimals as usize);
        padded.parse().map_err(|_| invalid("value is too large"))?
    };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| invalid("value is too large"))
}

pub fn format_units(value: u128, decimals: u8) -> String {
    if decimals == 0 {
        return value.to_string();
    }
    let scale = 10u128.pow(decimals as u32);
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0>width$}", width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

pub fn parse_price(text: &str) -> Result<u64, ValidationError> {
    let raw = parse_units("price", text, PRICE_DECIMALS)?;
    if raw == 0 {
        return Err(ValidationError::InvalidAmount {
            field: "price",
            reason: "must be greater than zero".into(),
        });
    }
    u64::try_from(raw).map_err(|_| ValidationError::InvalidAmount {
        field: "price",
        reason: "value is too large".into(),
    })
}

pub fn format_price(price: u64) -> String {
    format_units(price as u128, PRICE_DECIMALS)
}

/// Fiat value of `amount` token units at `price`, scaled by [`PRICE_SCALE`].
pub fn fiat_value(amount: u128, decimals: u8, price: u64) -> Option<u128> {
    let scale = 10u128.checked_pow(decimals as u32)?;
    amount.checked_mul(price as u128).map(|v| v / scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_price_with_fixed_scale() {
        assert_eq!(parse_price("1.005").unwrap(), 1_005_000);
        assert_eq!(parse_price("42").unwrap(), 42_000_000);
        assert!(parse_price("0").is_err());
        assert!(parse_price("1.0000001").is_err());
    }

    #[test]
    fn parses_and_formats_units() {
        assert_eq!(parse_units("amount", "50", 6).unwrap(), 50_000_000);
        assert_eq!(parse_units("amount", ".5", 2).unwrap(), 50);
        assert_eq!(format_units(50_500_000, 6), "50.5");
        assert_eq!(format_units(7, 0), "7");
        assert!(parse_units("amount", "1,5", 6).is_err());
        assert!(parse_units("amount", "-3", 6).is_err());
        assert!(parse_units("amount", ".", 6).is_err());
    }

    #[test]
    fn fiat_value_of_deal() {
        // 50 tokens with 6 decimals at 1.005
        assert_eq!(fiat_value(50_000_000, 6, 1_005_000), Some(50_250_000));
    }
}
