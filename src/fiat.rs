//! Fiat markets are keyed by two-letter country codes packed into 16 bits
use super::error::ValidationError;
use std::fmt;

/// A country code packed as two uppercase ASCII bytes, high byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiatCode(u16);

pub const DEFAULT_FIAT: FiatCode = FiatCode(0x5553);

pub fn encode_country(code: &str) -> Result<u16, ValidationError> {
    let bytes = code.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_uppercase) {
        return Err(ValidationError::InvalidCountryCode(code.to_string()));
    }
    Ok(((bytes[0] as u16) << 8) | bytes[1] as u16)
}

pub fn decode_country(raw: u64) -> Result<String, ValidationError> {
    if raw > 0xFFFF {
        return Err(ValidationError::InvalidCountryValue(raw));
    }
    let high = (raw >> 8) as u8;
    let low = (raw & 0xFF) as u8;
    if !high.is_ascii_uppercase() || !low.is_ascii_uppercase() {
        return Err(ValidationError::InvalidCountryValue(raw));
    }
    Ok(String::from_utf8_lossy(&[high, low]).into_owned())
}

impl FiatCode {
    pub fn parse(code: &str) -> Result<Self, ValidationError> {
        encode_country(code).map(FiatCode)
    }
    pub fn from_raw(raw: u64) -> Result<Self, ValidationError> {
        decode_country(raw)?;
        Ok(FiatCode(raw as u16))
    }
    pub fn raw(&self) -> u16 {
        self.0
    }
    pub fn country(&self) -> String {
        let [high, low] = self.0.to_be_bytes();
        String::from_utf8_lossy(&[high, low]).into_owned()
    }
}

impl fmt::Display for FiatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.country())
    }
}

impl<C> minicbor::Encode<C> for FiatCode {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.u16(self.0)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for FiatCode {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let raw = d.u16()?;
        FiatCode::from_raw(raw as u64)
            .map_err(|_| minicbor::decode::Error::message("malformed country code"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiatInfo {
    pub country: &'static str,
    pub currency: &'static str,
    pub name: &'static str,
}

/// Reference set of supported fiat markets.
pub const FIATS: &[FiatInfo] = &[
    FiatInfo { country: "US", currency: "USD", name: "United States" },
    FiatInfo { country: "GB", currency: "GBP", name: "United Kingdom" },
    FiatInfo { country: "DE", currency: "EUR", name: "Germany" },
    FiatInfo { country: "FR", currency: "EUR", name: "France" },
    FiatInfo { country: "ES", currency: "EUR", name: "Spain" },
    FiatInfo { country: "IT", currency: "EUR", name: "Italy" },
    FiatInfo { country: "NL", currency: "EUR", name: "Netherlands" },
    FiatInfo { country: "CH", currency: "CHF", name: "Switzerland" },
    FiatInfo { country: "CA", currency: "CAD", name: "Canada" },
    FiatInfo { country: "AU", currency: "AUD", name: "Australia" },
    FiatInfo { country: "BR", currency: "BRL", name: "Brazil" },
    FiatInfo { country: "AR", currency: "ARS", name: "Argentina" },
    FiatInfo { country: "MX", currency: "MXN", name: "Mexico" },
    FiatInfo { country: "NG", currency: "NGN", name: "Nigeria" },
    FiatInfo { country: "KE", currency: "KES", name: "Kenya" },
    FiatInfo { country: "IN", currency: "INR", name: "India" },
    FiatInfo { country: "TR", currency: "TRY", name: "Turkey" },
    FiatInfo { country: "VN", currency: "VND", name: "Vietnam" },
    FiatInfo { country: "PH", currency: "PHP", name: "Philippines" },
    FiatInfo { country: "ID", currency: "IDR", name: "Indonesia" },
];

pub fn lookup(code: FiatCode) -> Option<&'static FiatInfo> {
    let country = code.country();
    FIATS.iter().find(|f| f.country == country)
}

/// Resolves user input to a known market, falling back to `default` for
/// anything unknown or malformed.
pub fn normalize(input: &str, default: FiatCode) -> FiatCode {
    let upper = input.trim().to_ascii_uppercase();
    match FiatCode::parse(&upper) {
        Ok(code) if lookup(code).is_some() => code,
        _ => {
            tracing::debug!(input, fallback = %default, "unknown fiat market, using default");
            default
        }
    }
}

/// Display label, e.g. `USD (United States)`; unknown codes show the bare country.
pub fn label(code: FiatCode) -> String {
    match lookup(code) {
        Some(info) => format!("{} ({})", info.currency, info.name),
        None => code.country(),
    }
}
