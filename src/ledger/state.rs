use crate::core::currency::CurrencyCode;
use crate::core::exchange::ExchangeId;
use crate::core::lot::{Lot, LotKey, LotQueue};
use crate::ledger::engine::LedgerError;
use chrono::{DateTime, Utc};
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot format version written by this build.
pub const STATE_VERSION: u32 = 1;

/// Everything the engine needs to continue where it stopped.
///
/// Holds the lot queues per (currency, exchange), lots withdrawn under a
/// transfer tag that have not arrived yet, and a cursor identifying the
/// last processed trade: its timestamp plus how many trades at exactly
/// that timestamp have been processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    home_currency: CurrencyCode,
    queues: BTreeMap<LotKey, LotQueue>,
    in_transit: BTreeMap<String, Vec<Lot>>,
    last_trade_at: Option<DateTime<Utc>>,
    processed_at_last: usize,
}

impl EngineState {
    pub fn new(home_currency: impl Into<CurrencyCode>) -> Self {
        Self {
            home_currency: home_currency.into(),
            queues: BTreeMap::new(),
            in_transit: BTreeMap::new(),
            last_trade_at: None,
            processed_at_last: 0,
        }
    }

    pub fn home_currency(&self) -> &CurrencyCode {
        &self.home_currency
    }

    pub fn last_trade_at(&self) -> Option<DateTime<Utc>> {
        self.last_trade_at
    }

    pub fn processed_at_last(&self) -> usize {
        self.processed_at_last
    }

    /// Advance the cursor past a trade at `time`.
    pub(crate) fn record_trade(&mut self, time: DateTime<Utc>) {
        if self.last_trade_at == Some(time) {
            self.processed_at_last += 1;
        } else {
            self.last_trade_at = Some(time);
            self.processed_at_last = 1;
        }
    }

    pub fn queue(&self, key: &LotKey) -> Option<&LotQueue> {
        self.queues.get(key)
    }

    pub(crate) fn queue_mut(&mut self, key: &LotKey) -> &mut LotQueue {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| LotQueue::new(key.clone()))
    }

    /// Non-empty queues in key order.
    pub fn queues(&self) -> impl Iterator<Item = &LotQueue> {
        self.queues.values().filter(|q| !q.is_empty())
    }

    /// Amount of `currency` held on `exchange`.
    pub fn balance(&self, currency: &CurrencyCode, exchange: &ExchangeId) -> Decimal {
        self.queue(&LotKey::new(currency.clone(), exchange.clone()))
            .map(|q| q.total())
            .unwrap_or(Decimal::ZERO)
    }

    /// Amount of `currency` held across all exchanges, excluding lots in transit.
    pub fn total(&self, currency: &CurrencyCode) -> Decimal {
        self.queues
            .values()
            .filter(|q| &q.key().currency == currency)
            .map(|q| q.total())
            .sum()
    }

    /// Remaining cost basis of `currency` across all exchanges.
    pub fn total_cost(&self, currency: &CurrencyCode) -> Decimal {
        self.queues
            .values()
            .filter(|q| &q.key().currency == currency)
            .map(|q| q.total_cost())
            .sum()
    }

    /// Currencies currently held somewhere.
    pub fn currencies(&self) -> Vec<CurrencyCode> {
        let mut currencies: Vec<CurrencyCode> =
            self.queues().map(|q| q.key().currency.clone()).collect();
        // queues are ordered by currency first
        currencies.dedup();
        currencies
    }

    pub fn in_transit(&self, tag: &str) -> Option<&[Lot]> {
        self.in_transit.get(tag).map(Vec::as_slice)
    }

    pub fn transfers_in_transit(&self) -> impl Iterator<Item = (&str, &[Lot])> {
        self.in_transit
            .iter()
            .map(|(tag, lots)| (tag.as_str(), lots.as_slice()))
    }

    /// Park withdrawn lots under `tag`. Returns `false` if the tag is
    /// already in use.
    pub(crate) fn hold_in_transit(&mut self, tag: &str, lots: Vec<Lot>) -> bool {
        if self.in_transit.contains_key(tag) {
            return false;
        }
        self.in_transit.insert(tag.to_string(), lots);
        true
    }

    pub(crate) fn take_in_transit(&mut self, tag: &str) -> Option<Vec<Lot>> {
        self.in_transit.remove(tag)
    }

    /// Serialize to the versioned JSON snapshot format.
    pub fn to_json(&self) -> Result<String, LedgerError> {
        let snapshot = Snapshot {
            version: STATE_VERSION,
            home_currency: self.home_currency.clone(),
            last_trade_at: self.last_trade_at,
            processed_at_last: self.processed_at_last,
            lots: self.queues.values().flat_map(|q| q.lots().cloned()).collect(),
            in_transit: self.in_transit.clone(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Restore from a snapshot written by [`to_json`](Self::to_json).
    ///
    /// The snapshot must be in the current format and recorded with
    /// `home_currency`.
    pub fn from_json(json: &str, home_currency: &CurrencyCode) -> Result<Self, LedgerError> {
        let probe: VersionProbe = serde_json::from_str(json)?;
        if probe.version != STATE_VERSION {
            return Err(LedgerError::StateVersionMismatch {
                found: probe.version,
                expected: STATE_VERSION,
            });
        }
        let snapshot: Snapshot = serde_json::from_str(json)?;
        if &snapshot.home_currency != home_currency {
            return Err(LedgerError::HomeCurrencyMismatch {
                found: snapshot.home_currency,
                expected: home_currency.clone(),
            });
        }

        let mut state = Self::new(snapshot.home_currency);
        state.last_trade_at = snapshot.last_trade_at;
        state.processed_at_last = snapshot.processed_at_last;
        for lot in snapshot.lots {
            state.queue_mut(&lot.key()).add_lot(lot);
        }
        state.in_transit = snapshot.in_transit;
        Ok(state)
    }
}

/// The changes one trade makes to an [`EngineState`].
///
/// Every queue and transfer is copied the first time it is touched.
/// Dropping the transaction without [`commit`](Self::commit) puts those
/// copies back, so a failed trade leaves the state as it found it.
pub(crate) struct StateTransaction<'a> {
    state: &'a mut EngineState,
    queues: BTreeMap<LotKey, Option<LotQueue>>,
    in_transit: BTreeMap<String, Option<Vec<Lot>>>,
    committed: bool,
}

impl<'a> StateTransaction<'a> {
    pub(crate) fn begin(state: &'a mut EngineState) -> Self {
        Self {
            state,
            queues: BTreeMap::new(),
            in_transit: BTreeMap::new(),
            committed: false,
        }
    }

    pub(crate) fn queue_mut(&mut self, key: &LotKey) -> &mut LotQueue {
        if !self.queues.contains_key(key) {
            let before = self.state.queues.get(key).cloned();
            self.queues.insert(key.clone(), before);
        }
        self.state.queue_mut(key)
    }

    pub(crate) fn hold_in_transit(&mut self, tag: &str, lots: Vec<Lot>) -> bool {
        self.save_transfer(tag);
        self.state.hold_in_transit(tag, lots)
    }

    pub(crate) fn take_in_transit(&mut self, tag: &str) -> Option<Vec<Lot>> {
        self.save_transfer(tag);
        self.state.take_in_transit(tag)
    }

    fn save_transfer(&mut self, tag: &str) {
        if !self.in_transit.contains_key(tag) {
            let before = self.state.in_transit.get(tag).cloned();
            self.in_transit.insert(tag.to_string(), before);
        }
    }

    /// Keep the changes and advance the cursor past a trade at `time`.
    pub(crate) fn commit(mut self, time: DateTime<Utc>) {
        for key in self.queues.keys() {
            if self.state.queues.get(key).is_some_and(LotQueue::is_empty) {
                self.state.queues.remove(key);
            }
        }
        self.state.record_trade(time);
        self.committed = true;
    }
}

impl Drop for StateTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (key, before) in std::mem::take(&mut self.queues) {
            match before {
                Some(queue) => self.state.queues.insert(key, queue),
                None => self.state.queues.remove(&key),
            };
        }
        for (tag, before) in std::mem::take(&mut self.in_transit) {
            match before {
                Some(lots) => self.state.in_transit.insert(tag, lots),
                None => self.state.in_transit.remove(&tag),
            };
        }
        debug!("rolled back a failed trade");
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    home_currency: CurrencyCode,
    last_trade_at: Option<DateTime<Utc>>,
    processed_at_last: usize,
    lots: Vec<Lot>,
    #[serde(default)]
    in_transit: BTreeMap<String, Vec<Lot>>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

/// Receives the engine state before every trade so that a crashed run
/// can be resumed.
pub trait SnapshotStore {
    fn store(&mut self, state: &EngineState) -> Result<(), LedgerError>;
}

/// Keeps the latest snapshot in one JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored state back.
    pub fn load(&self, home_currency: &CurrencyCode) -> Result<EngineState, LedgerError> {
        let json = fs::read_to_string(&self.path)?;
        EngineState::from_json(&json, home_currency)
    }
}

impl SnapshotStore for JsonFileStore {
    fn store(&mut self, state: &EngineState) -> Result<(), LedgerError> {
        let json = state.to_json()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("state snapshot written to {}", self.path.display());
        Ok(())
    }
}

/// Keeps snapshots in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    latest: Option<EngineState>,
    stores: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&EngineState> {
        self.latest.as_ref()
    }

    /// Number of snapshots received.
    pub fn stores(&self) -> usize {
        self.stores
    }
}

impl SnapshotStore for MemoryStore {
    fn store(&mut self, state: &EngineState) -> Result<(), LedgerError> {
        self.latest = Some(state.clone());
        self.stores += 1;
        Ok(())
    }
}
