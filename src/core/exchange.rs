use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the exchange or wallet holding a lot.
///
/// Holdings are tracked per exchange: the same currency held on two
/// exchanges lives in two independent lot queues.
///
/// # Examples
///
/// ```
/// use ccgains::core::exchange::ExchangeId;
///
/// let kraken = ExchangeId::new("Kraken");
/// let wallet = ExchangeId::new("cold-wallet");
/// assert_ne!(kraken, wallet);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
