use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Currency symbol, fiat or digital.
///
/// Symbols are normalized to upper case so that `"btc"` and `"BTC"`
/// address the same lot queues and rate-graph node.
///
/// # Examples
///
/// ```
/// use ccgains::core::currency::CurrencyCode;
///
/// let btc = CurrencyCode::new("btc");
/// assert_eq!(btc.as_str(), "BTC");
/// assert_ne!(btc, CurrencyCode::new("EUR"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CurrencyCode {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CurrencyCode {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid currency pair '{0}', expected BASE/QUOTE")]
pub struct ParsePairError(String);

/// A quoted currency pair.
///
/// A rate for the pair is the number of `quote` units one unit of
/// `base` buys: for `BTC/EUR` at 1000, one BTC costs 1000 EUR.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
}

impl CurrencyPair {
    pub fn new(base: impl Into<CurrencyCode>, quote: impl Into<CurrencyCode>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// The same pair quoted the other way round.
    pub fn reversed(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }

    /// Whether `currency` is one of the two legs.
    pub fn involves(&self, currency: &CurrencyCode) -> bool {
        &self.base == currency || &self.quote == currency
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = ParsePairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((base, quote)) if !base.trim().is_empty() && !quote.trim().is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(ParsePairError(s.to_string())),
        }
    }
}
