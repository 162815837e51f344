//! Per-identity rate counters
//!
//! Fixed-window counters keyed by (identity, dimension). A window opens on
//! the first observation of a key and lasts for the dimension's window
//! length; the first observation after it elapses resets the value to zero
//! and opens a new window. The value reported back is the total for the
//! current window including the amount just added.
//!
//! The table is a [`DashMap`], so each key is updated under its shard lock
//! and unrelated identities hash to different shards. Idle entries are
//! removed by [`RateCounters::sweep`] under the same shard locks, which keeps
//! eviction from racing an in-flight increment.

pub mod sweeper;

use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

pub use sweeper::spawn_sweeper;

/// Share of `max_entries` kept after a capacity eviction pass
const CAPACITY_LOW_WATERMARK: f64 = 0.9;

/// Smallest usable cap: every dimension of a single identity
pub const MIN_ENTRIES: usize = Dimension::ALL.len();

/// A limited quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    ReqPerSecond,
    ReqPerMinute,
    BytesIn,
    BytesOut,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::ReqPerSecond,
        Dimension::ReqPerMinute,
        Dimension::BytesIn,
        Dimension::BytesOut,
    ];

    /// Window length of this dimension
    pub fn window(&self) -> Duration {
        match self {
            Dimension::ReqPerSecond => Duration::from_secs(1),
            Dimension::ReqPerMinute | Dimension::BytesIn | Dimension::BytesOut => {
                Duration::from_secs(60)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::ReqPerSecond => "req_per_second",
            Dimension::ReqPerMinute => "req_per_minute",
            Dimension::BytesIn => "bytes_in",
            Dimension::BytesOut => "bytes_out",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub identity: String,
    pub dimension: Dimension,
}

impl CounterKey {
    pub fn new(identity: &str, dimension: Dimension) -> Self {
        Self {
            identity: identity.to_string(),
            dimension,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub window_start: Instant,
    pub value: u64,
    pub last_touched: Instant,
}

impl CounterState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            value: 0,
            last_touched: now,
        }
    }

    fn expired(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    fn add(&mut self, window: Duration, amount: u64, now: Instant) -> u64 {
        if self.expired(window, now) {
            self.window_start = now;
            self.value = 0;
        }
        self.value = self.value.saturating_add(amount);
        self.last_touched = self.last_touched.max(now);
        self.value
    }
}

/// Counter table tuning
#[derive(Debug, Clone, Copy)]
pub struct CounterSettings {
    /// Entries idle for this many windows are evicted (at least 2)
    pub idle_windows: u32,
    /// Hard cap on live entries
    pub max_entries: usize,
}

impl Default for CounterSettings {
    fn default() -> Self {
        Self {
            idle_windows: 2,
            max_entries: 100_000,
        }
    }
}

/// Rate counters for every (identity, dimension) pair seen recently
pub struct RateCounters {
    table: DashMap<CounterKey, CounterState>,
    idle_windows: u32,
    max_entries: usize,
}

impl RateCounters {
    pub fn new(settings: CounterSettings) -> Self {
        Self {
            table: DashMap::new(),
            idle_windows: settings.idle_windows.max(2),
            max_entries: settings.max_entries.max(MIN_ENTRIES),
        }
    }

    /// Add `amount` to the current window and return the window total
    pub fn observe(&self, identity: &str, dimension: Dimension, amount: u64, now: Instant) -> u64 {
        let window = dimension.window();

        let (value, inserted) = match self.table.entry(CounterKey::new(identity, dimension)) {
            Entry::Occupied(mut entry) => (entry.get_mut().add(window, amount, now), false),
            Entry::Vacant(entry) => {
                let mut state = CounterState::new(now);
                let value = state.add(window, amount, now);
                entry.insert(state);
                (value, true)
            }
        };

        // Shard guard is released here, so scanning the table cannot deadlock
        if inserted && self.table.len() > self.max_entries {
            self.evict_oldest(Some(&CounterKey::new(identity, dimension)));
        }

        value
    }

    /// Total of the current window without adding to it
    pub fn current(&self, identity: &str, dimension: Dimension, now: Instant) -> u64 {
        self.table
            .get(&CounterKey::new(identity, dimension))
            .filter(|state| !state.expired(dimension.window(), now))
            .map(|state| state.value)
            .unwrap_or(0)
    }

    /// Evict idle entries, then enforce the entry cap. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.table.retain(|key, state| {
            let idle_after = key.dimension.window() * self.idle_windows;
            let keep = now.saturating_duration_since(state.last_touched) < idle_after;
            if !keep {
                evicted += 1;
            }
            keep
        });

        if self.table.len() > self.max_entries {
            evicted += self.evict_oldest(None);
        }

        metrics::record_counter_sweep(evicted, self.table.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.table.len(), "Counter sweep");
        }
        evicted
    }

    /// Drop least recently touched entries down to the low watermark.
    /// `keep` is never evicted; it is the key whose insert caused the pass.
    fn evict_oldest(&self, keep: Option<&CounterKey>) -> usize {
        let target = (self.max_entries as f64 * CAPACITY_LOW_WATERMARK) as usize;
        let excess = self.table.len().saturating_sub(target);
        if excess == 0 {
            return 0;
        }

        let mut by_age: Vec<(Instant, CounterKey)> = self
            .table
            .iter()
            .filter(|entry| Some(entry.key()) != keep)
            .map(|entry| (entry.last_touched, entry.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(touched, _)| *touched);

        let mut evicted = 0;
        for (touched, key) in by_age.into_iter().take(excess) {
            // Skip entries touched again since the scan
            if self
                .table
                .remove_if(&key, |_, state| state.last_touched <= touched)
                .is_some()
            {
                evicted += 1;
            }
        }

        debug!(evicted, cap = self.max_entries, "Counter table over capacity");
        evicted
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for RateCounters {
    fn default() -> Self {
        Self::new(CounterSettings::default())
    }
}
