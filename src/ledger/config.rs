use crate::core::currency::CurrencyCode;
use crate::ledger::engine::LedgerError;
use crate::rates::graph::DEFAULT_TOLERANCE_HOURS;
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Minimum holding time for a disposal to count as long-term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldingPeriod {
    /// Calendar years: a lot bought on 2017-03-15 matures on 2018-03-15.
    Years(u32),
    Days(u32),
}

impl HoldingPeriod {
    /// The instant from which a lot acquired at `acquired` is held long-term.
    pub fn matures_at(self, acquired: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Years(n) => acquired.checked_add_months(Months::new(n.checked_mul(12)?)),
            Self::Days(n) => acquired.checked_add_signed(Duration::days(i64::from(n))),
        }
    }

    pub fn is_long_term(self, acquired: DateTime<Utc>, disposed: DateTime<Utc>) -> bool {
        self.matures_at(acquired)
            .map_or(false, |matures| disposed >= matures)
    }
}

impl Default for HoldingPeriod {
    fn default() -> Self {
        Self::Years(1)
    }
}

/// Engine settings.
///
/// Every field has a default, so a config file only needs to list what
/// it changes:
///
/// ```
/// use ccgains::ledger::config::{EngineConfig, HoldingPeriod};
///
/// let config: EngineConfig = serde_json::from_str(r#"{ "home_currency": "usd" }"#).unwrap();
/// assert_eq!(config.home_currency.as_str(), "USD");
/// assert_eq!(config.holding_period, HoldingPeriod::Years(1));
/// assert_eq!(config.rate_tolerance_hours, 24);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Currency all gains are reported in. Never tracked as lots.
    pub home_currency: CurrencyCode,
    pub holding_period: HoldingPeriod,
    /// How far the nearest sample may be from a trade for a rate edge to
    /// be preferred during path search.
    pub rate_tolerance_hours: i64,
}

impl EngineConfig {
    pub fn new(home_currency: impl Into<CurrencyCode>) -> Self {
        Self {
            home_currency: home_currency.into(),
            ..Default::default()
        }
    }

    pub fn with_holding_period(mut self, period: HoldingPeriod) -> Self {
        self.holding_period = period;
        self
    }

    pub fn rate_tolerance(&self) -> Duration {
        Duration::hours(self.rate_tolerance_hours)
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home_currency: CurrencyCode::new("EUR"),
            holding_period: HoldingPeriod::default(),
            rate_tolerance_hours: DEFAULT_TOLERANCE_HOURS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_one_year_boundary() {
        let bought = Utc.with_ymd_and_hms(2017, 3, 15, 10, 0, 0).unwrap();
        let period = HoldingPeriod::Years(1);
        let matures = Utc.with_ymd_and_hms(2018, 3, 15, 10, 0, 0).unwrap();

        assert_eq!(period.matures_at(bought), Some(matures));
        assert!(!period.is_long_term(bought, matures - Duration::days(1)));
        assert!(period.is_long_term(bought, matures));
        assert!(period.is_long_term(bought, matures + Duration::days(1)));
    }

    #[test]
    fn test_leap_day_matures_end_of_february() {
        let bought = Utc.with_ymd_and_hms(2016, 2, 29, 0, 0, 0).unwrap();
        assert_eq!(
            HoldingPeriod::Years(1).matures_at(bought),
            Some(Utc.with_ymd_and_hms(2017, 2, 28, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_day_based_period() {
        let bought = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        let period = HoldingPeriod::Days(30);
        assert!(!period.is_long_term(bought, bought + Duration::days(29)));
        assert!(period.is_long_term(bought, bought + Duration::days(30)));
    }

    #[test]
    fn test_config_round_trip() {
        let config = EngineConfig::new("usd").with_holding_period(HoldingPeriod::Days(183));
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.rate_tolerance(), Duration::hours(24));
    }
}
