use crate::core::currency::{CurrencyCode, CurrencyPair};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors arising from rate lookups and conversions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateError {
    #[error("no price data available for {pair}")]
    NoPriceData { pair: CurrencyPair },

    #[error("no conversion path between {from} and {to}")]
    UnrelatedCurrencies {
        from: CurrencyCode,
        to: CurrencyCode,
    },

    #[error("rate must be positive, got {rate} for {pair} at {time}")]
    InvalidRate {
        pair: CurrencyPair,
        time: DateTime<Utc>,
        rate: Decimal,
    },

    #[error("rate source failed for {pair}: {message}")]
    SourceFailed { pair: CurrencyPair, message: String },
}

/// A provider of historical samples for one or more pairs.
///
/// Implementations decide how much data to return around the requested
/// instant and whether to cache it. Retrying transient failures is the
/// source's business; the series only logs a failed fetch.
pub trait RateSource {
    fn fetch_around(
        &self,
        pair: &CurrencyPair,
        time: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, Decimal)>, RateError>;
}

/// Historical rates of one currency pair, in `quote` units per `base`.
///
/// Samples are kept ordered by time. A lookup returns the latest sample
/// at or before the requested instant, or the earliest one after it if
/// the instant precedes all data.
///
/// # Examples
///
/// ```
/// use ccgains::core::currency::CurrencyPair;
/// use ccgains::rates::series::RateSeries;
/// use chrono::{Duration, TimeZone, Utc};
/// use rust_decimal_macros::dec;
///
/// let t0 = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
/// let mut series = RateSeries::new(CurrencyPair::new("BTC", "EUR"));
/// series
///     .extend(vec![(t0, dec!(1000)), (t0 + Duration::hours(1), dec!(1010))])
///     .unwrap();
///
/// assert_eq!(series.lookup(t0 + Duration::minutes(30)).unwrap(), dec!(1000));
/// assert_eq!(series.lookup(t0 - Duration::days(1)).unwrap(), dec!(1000));
/// assert_eq!(series.lookup(t0 + Duration::days(1)).unwrap(), dec!(1010));
/// ```
pub struct RateSeries {
    pair: CurrencyPair,
    samples: BTreeMap<DateTime<Utc>, Decimal>,
    source: Option<Box<dyn RateSource>>,
}

impl RateSeries {
    pub fn new(pair: CurrencyPair) -> Self {
        Self {
            pair,
            samples: BTreeMap::new(),
            source: None,
        }
    }

    /// Build a series from a batch of samples.
    pub fn with_samples(
        pair: CurrencyPair,
        samples: impl IntoIterator<Item = (DateTime<Utc>, Decimal)>,
    ) -> Result<Self, RateError> {
        let mut series = Self::new(pair);
        series.extend(samples)?;
        Ok(series)
    }

    /// Attach a source consulted by [`ensure_coverage`](Self::ensure_coverage).
    pub fn with_source(mut self, source: Box<dyn RateSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Build a series from raw trade observations `(time, price, volume)`.
    ///
    /// Observations are grouped into buckets of `interval` starting at
    /// the floored observation time; each bucket becomes one sample whose
    /// rate is the volume-weighted average price. Buckets with zero total
    /// volume are dropped, and gaps are bridged by the lookup policy.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is not positive.
    pub fn from_observations(
        pair: CurrencyPair,
        observations: impl IntoIterator<Item = (DateTime<Utc>, Decimal, Decimal)>,
        interval: Duration,
    ) -> Result<Self, RateError> {
        let step = interval.num_seconds();
        assert!(step > 0, "resampling interval must be positive");

        // bucket start -> (sum of price * volume, sum of volume)
        let mut buckets: BTreeMap<i64, (Decimal, Decimal)> = BTreeMap::new();
        for (time, price, volume) in observations {
            let secs = time.timestamp();
            let start = secs - secs.rem_euclid(step);
            let bucket = buckets.entry(start).or_insert((Decimal::ZERO, Decimal::ZERO));
            bucket.0 += price * volume;
            bucket.1 += volume;
        }

        let mut samples = Vec::with_capacity(buckets.len());
        for (start, (weighted, volume)) in buckets {
            if volume == Decimal::ZERO {
                continue;
            }
            if let Some(time) = Utc.timestamp_opt(start, 0).single() {
                samples.push((time, weighted / volume));
            }
        }
        Self::with_samples(pair, samples)
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Time of the first and last sample.
    pub fn range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.samples.keys().next()?;
        let last = self.samples.keys().next_back()?;
        Some((*first, *last))
    }

    pub fn samples(&self) -> impl Iterator<Item = (&DateTime<Utc>, &Decimal)> {
        self.samples.iter()
    }

    /// Rate in effect at `time`.
    pub fn lookup(&self, time: DateTime<Utc>) -> Result<Decimal, RateError> {
        self.samples
            .range(..=time)
            .next_back()
            .or_else(|| self.samples.range(time..).next())
            .map(|(_, rate)| *rate)
            .ok_or_else(|| RateError::NoPriceData {
                pair: self.pair.clone(),
            })
    }

    /// Merge samples into the series. A sample at an existing timestamp
    /// replaces the old one. Returns the number of samples merged.
    ///
    /// Nothing is merged if any rate is not positive.
    pub fn extend(
        &mut self,
        samples: impl IntoIterator<Item = (DateTime<Utc>, Decimal)>,
    ) -> Result<usize, RateError> {
        let samples: Vec<(DateTime<Utc>, Decimal)> = samples.into_iter().collect();
        if let Some((time, rate)) = samples.iter().find(|(_, r)| *r <= Decimal::ZERO) {
            return Err(RateError::InvalidRate {
                pair: self.pair.clone(),
                time: *time,
                rate: *rate,
            });
        }
        let merged = samples.len();
        self.samples.extend(samples);
        Ok(merged)
    }

    /// Whether a sample lies within `tolerance` of `time`.
    pub fn covers(&self, time: DateTime<Utc>, tolerance: Duration) -> bool {
        self.samples
            .range(time - tolerance..=time + tolerance)
            .next()
            .is_some()
    }

    /// Make sure the series covers `time`, fetching from the attached
    /// source if needed. Returns whether `time` is covered afterwards.
    pub fn ensure_coverage(&mut self, time: DateTime<Utc>, tolerance: Duration) -> bool {
        if self.covers(time, tolerance) {
            return true;
        }
        let fetched = match &self.source {
            Some(source) => source.fetch_around(&self.pair, time),
            None => return false,
        };
        match fetched.and_then(|samples| self.extend(samples)) {
            Ok(merged) => {
                debug!("fetched {} samples for {} around {}", merged, self.pair, time);
                self.covers(time, tolerance)
            }
            Err(e) => {
                warn!("could not extend {} around {}: {}", self.pair, time, e);
                false
            }
        }
    }
}

impl fmt::Debug for RateSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateSeries")
            .field("pair", &self.pair)
            .field("samples", &self.samples.len())
            .field("range", &self.range())
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::cell::Cell;
    use std::rc::Rc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 1, 0, 0, 0).unwrap()
    }

    fn btc_eur() -> CurrencyPair {
        CurrencyPair::new("BTC", "EUR")
    }

    struct CountingSource {
        calls: Rc<Cell<usize>>,
        rate: Decimal,
    }

    impl RateSource for CountingSource {
        fn fetch_around(
            &self,
            _pair: &CurrencyPair,
            time: DateTime<Utc>,
        ) -> Result<Vec<(DateTime<Utc>, Decimal)>, RateError> {
            self.calls.set(self.calls.get() + 1);
            Ok(vec![(time, self.rate)])
        }
    }

    struct FailingSource;

    impl RateSource for FailingSource {
        fn fetch_around(
            &self,
            pair: &CurrencyPair,
            _time: DateTime<Utc>,
        ) -> Result<Vec<(DateTime<Utc>, Decimal)>, RateError> {
            Err(RateError::SourceFailed {
                pair: pair.clone(),
                message: "offline".to_string(),
            })
        }
    }

    #[test]
    fn test_lookup_empty_series() {
        let series = RateSeries::new(btc_eur());
        assert_eq!(
            series.lookup(t0()),
            Err(RateError::NoPriceData { pair: btc_eur() })
        );
    }

    #[test]
    fn test_lookup_prefers_earlier_sample() {
        let series = RateSeries::with_samples(
            btc_eur(),
            vec![
                (t0(), dec!(2000)),
                (t0() + Duration::hours(2), dec!(2100)),
                (t0() + Duration::hours(4), dec!(2200)),
            ],
        )
        .unwrap();
        assert_eq!(series.lookup(t0() + Duration::hours(2)).unwrap(), dec!(2100));
        assert_eq!(series.lookup(t0() + Duration::hours(3)).unwrap(), dec!(2100));
        assert_eq!(series.lookup(t0() - Duration::hours(3)).unwrap(), dec!(2000));
    }

    #[test]
    fn test_extend_overwrites_duplicates() {
        let mut series = RateSeries::with_samples(btc_eur(), vec![(t0(), dec!(1))]).unwrap();
        series
            .extend(vec![(t0(), dec!(2)), (t0() - Duration::hours(1), dec!(3))])
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.lookup(t0()).unwrap(), dec!(2));
        assert_eq!(series.range().unwrap().0, t0() - Duration::hours(1));
    }

    #[test]
    fn test_extend_rejects_non_positive_rate() {
        let mut series = RateSeries::new(btc_eur());
        let err = series
            .extend(vec![(t0(), dec!(5)), (t0() + Duration::hours(1), Decimal::ZERO)])
            .unwrap_err();
        assert!(matches!(err, RateError::InvalidRate { .. }));
        assert!(series.is_empty());
    }

    #[test]
    fn test_covers_within_tolerance() {
        let series = RateSeries::with_samples(btc_eur(), vec![(t0(), dec!(1))]).unwrap();
        assert!(series.covers(t0() + Duration::hours(24), Duration::hours(24)));
        assert!(!series.covers(t0() + Duration::hours(25), Duration::hours(24)));
        assert!(series.covers(t0() - Duration::hours(1), Duration::hours(1)));
    }

    #[test]
    fn test_ensure_coverage_fetches_once() {
        let calls = Rc::new(Cell::new(0));
        let mut series = RateSeries::new(btc_eur()).with_source(Box::new(CountingSource {
            calls: calls.clone(),
            rate: dec!(1500),
        }));
        assert!(series.ensure_coverage(t0(), Duration::hours(1)));
        assert!(series.ensure_coverage(t0(), Duration::hours(1)));
        assert_eq!(calls.get(), 1);
        assert_eq!(series.lookup(t0()).unwrap(), dec!(1500));
    }

    #[test]
    fn test_ensure_coverage_failure_is_not_fatal() {
        let mut series = RateSeries::with_samples(btc_eur(), vec![(t0(), dec!(1))])
            .unwrap()
            .with_source(Box::new(FailingSource));
        assert!(!series.ensure_coverage(t0() + Duration::days(30), Duration::hours(1)));
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_from_observations_volume_weighted() {
        let obs = vec![
            (t0() + Duration::minutes(5), dec!(100), dec!(1)),
            (t0() + Duration::minutes(50), dec!(200), dec!(3)),
            (t0() + Duration::minutes(70), dec!(300), dec!(2)),
            (t0() + Duration::minutes(130), dec!(999), Decimal::ZERO),
        ];
        let series = RateSeries::from_observations(btc_eur(), obs, Duration::hours(1)).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.lookup(t0()).unwrap(), dec!(175));
        assert_eq!(series.lookup(t0() + Duration::hours(1)).unwrap(), dec!(300));
        // the zero-volume bucket is bridged by the previous sample
        assert_eq!(series.lookup(t0() + Duration::hours(2)).unwrap(), dec!(300));
    }
}
