//! Offer form validation
//!
//! Everything here runs before the ledger is contacted; failures are
//! field-specific [`ValidationError`]s.
use super::amount;
use super::error::ValidationError;
use super::fiat::{self, FiatCode};
use super::ledger::OfferPatch;
use super::types::{Offer, Side, TokenInfo};

pub const MAX_METHODS: usize = 8;
pub const MAX_METHOD_LEN: usize = 32;
pub const MAX_TERMS_LEN: usize = 280;

/// Raw maker input, as typed into the offer form.
#[derive(Debug, Clone)]
pub struct OfferForm {
    pub token: TokenInfo,
    pub side: Side,
    pub fiat: String,
    pub price: String,
    pub min: String,
    pub max: String,
    pub reserve: String,
    pub methods: String,
    pub terms: String,
}

/// A validated offer with every field normalized and scaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferDraft {
    pub token: TokenInfo,
    pub side: Side,
    pub fiat: FiatCode,
    pub price: u64,
    pub min: u128,
    pub max: u128,
    pub reserve: u128,
    pub methods: String,
    pub terms: String,
}

/// Splits on commas, trims, drops empties and case-insensitive duplicates.
pub fn normalize_methods(text: &str) -> Result<String, ValidationError> {
    let mut methods: Vec<&str> = Vec::new();
    for method in text.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        if method.chars().count() > MAX_METHOD_LEN {
            return Err(ValidationError::InvalidPaymentMethods(format!(
                "{method:?} is longer than {MAX_METHOD_LEN} characters"
            )));
        }
        if let Some(bad) = method
            .chars()
            .find(|c| !(c.is_alphanumeric() || " -_.&/+()'".contains(*c)))
        {
            return Err(ValidationError::InvalidPaymentMethods(format!(
                "{method:?} contains {bad:?}"
            )));
        }
        if !methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            methods.push(method);
        }
    }
    if methods.is_empty() {
        return Err(ValidationError::InvalidPaymentMethods(
            "at least one payment method is required".into(),
        ));
    }
    if methods.len() > MAX_METHODS {
        return Err(ValidationError::InvalidPaymentMethods(format!(
            "at most {MAX_METHODS} methods"
        )));
    }
    Ok(methods.join(", "))
}

pub fn normalize_terms(text: &str) -> Result<String, ValidationError> {
    let trimmed = text.trim();
    if trimmed.chars().count() > MAX_TERMS_LEN {
        return Err(ValidationError::InvalidTerms(format!(
            "longer than {MAX_TERMS_LEN} characters"
        )));
    }
    if trimmed.chars().any(|c| c.is_control() && c != '\n') {
        return Err(ValidationError::InvalidTerms(
            "contains control characters".into(),
        ));
    }
    Ok(trimmed.to_string())
}

impl OfferForm {
    /// Validates against the tokens the market lists. The configured token
    /// record replaces whatever symbol and decimals the form carried.
    pub fn validate_for(&self, tokens: &[TokenInfo]) -> Result<OfferDraft, ValidationError> {
        let token = tokens
            .iter()
            .find(|t| t.address == self.token.address)
            .ok_or_else(|| ValidationError::UnknownToken(self.token.address.to_string()))?;
        OfferForm {
            token: token.clone(),
            ..self.clone()
        }
        .validate()
    }

    pub fn validate(&self) -> Result<OfferDraft, ValidationError> {
        let fiat_input = self.fiat.trim().to_ascii_uppercase();
        let fiat = FiatCode::parse(&fiat_input)?;
        if fiat::lookup(fiat).is_none() {
            return Err(ValidationError::InvalidCountryCode(self.fiat.clone()));
        }

        let decimals = self.token.decimals;
        let price = amount::parse_price(&self.price)?;
        let min = amount::parse_units("minimum", &self.min, decimals)?;
        let max = amount::parse_units("maximum", &self.max, decimals)?;
        let reserve = amount::parse_units("reserve", &self.reserve, decimals)?;
        if min == 0 {
            return Err(ValidationError::InvalidAmount {
                field: "minimum",
                reason: "must be greater than zero".into(),
            });
        }
        if min > max {
            return Err(ValidationError::LimitsOutOfOrder { min, max });
        }

        Ok(OfferDraft {
            token: self.token.clone(),
            side: self.side,
            fiat,
            price,
            min,
            max,
            reserve,
            methods: normalize_methods(&self.methods)?,
            terms: normalize_terms(&self.terms)?,
        })
    }
}

impl OfferDraft {
    /// Fields that differ from `current`; unchanged fields stay `None` so the
    /// ledger leaves them alone. With no current offer every field is sent.
    pub fn diff(&self, current: Option<&Offer>) -> OfferPatch {
        let Some(current) = current else {
            return OfferPatch {
                price: Some(self.price),
                min: Some(self.min),
                max: Some(self.max),
                reserve: Some(self.reserve),
                methods: Some(self.methods.clone()),
                terms: Some(self.terms.clone()),
            };
        };
        OfferPatch {
            price: (current.price != self.price).then_some(self.price),
            min: (current.min != self.min).then_some(self.min),
            max: (current.max != self.max).then_some(self.max),
            reserve: (current.reserve != self.reserve).then_some(self.reserve),
            methods: (current.methods != self.methods).then(|| self.methods.clone()),
            terms: (current.terms != self.terms).then(|| self.terms.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn form() -> OfferForm {
        OfferForm {
            token: TokenInfo {
                address: Address::parse("0x00000000000000000000000000000000000000cc").unwrap(),
                symbol: "USDT".into(),
                decimals: 6,
            },
            side: Side::Sell,
            fiat: "de".into(),
            price: "1.005".into(),
            min: "10".into(),
            max: "500".into(),
            reserve: "1000".into(),
            methods: " SEPA,  Wise, sepa ,,".into(),
            terms: "  KYC'd accounts only ".into(),
        }
    }

    #[test]
    fn normalizes_every_field() {
        let draft = form().validate().unwrap();
        assert_eq!(draft.fiat.country(), "DE");
        assert_eq!(draft.price, 1_005_000);
        assert_eq!(draft.min, 10_000_000);
        assert_eq!(draft.methods, "SEPA, Wise");
        assert_eq!(draft.terms, "KYC'd accounts only");
    }

    #[test]
    fn rejects_unlisted_token() {
        let listed = TokenInfo {
            address: Address::parse("0x00000000000000000000000000000000000000dd").unwrap(),
            symbol: "USDC".into(),
            decimals: 6,
        };
        assert!(matches!(
            form().validate_for(std::slice::from_ref(&listed)),
            Err(ValidationError::UnknownToken(_))
        ));

        let mut f = form();
        f.token.address = listed.address.clone();
        f.token.decimals = 18;
        assert_eq!(f.validate_for(&[listed]).unwrap().min, 10_000_000);
    }

    #[test]
    fn rejects_inverted_limits() {
        let mut f = form();
        f.min = "600".into();
        assert!(matches!(
            f.validate(),
            Err(ValidationError::LimitsOutOfOrder { .. })
        ));
    }

    #[test]
    fn rejects_bad_methods() {
        assert!(normalize_methods(" , ").is_err());
        assert!(normalize_methods("Bank <script>").is_err());
        assert!(normalize_methods(&"x".repeat(MAX_METHOD_LEN + 1)).is_err());
    }

    #[test]
    fn rejects_unknown_fiat() {
        let mut f = form();
        f.fiat = "ZZ".into();
        assert!(matches!(
            f.validate(),
            Err(ValidationError::InvalidCountryCode(_))
        ));
    }
}
