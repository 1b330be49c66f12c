//! Concurrent, in-process metric aggregation.
use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use parking_lot::RwLock;
use quanta::{Clock, Instant};
use tracing::{debug, warn};

mod buckets;
pub use self::buckets::{HistogramBuckets, HistogramSnapshot, Matcher};

mod entry;
pub use self::entry::MetricState;
use self::entry::Entry;

use crate::{
    key::{MetricKey, MetricKind},
    queue::Operation,
};

/// A point-in-time copy of one series.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Identity of the series.
    pub key: MetricKey,

    /// Aggregated state at the time of collection.
    pub state: MetricState,

    /// When the series was last updated.
    pub last_update: Instant,
}

/// A concurrent map from metric identity to aggregated state.
///
/// The store is keyed first by metric name, which holds one entry per name and kind, and then by tag set within that
/// entry. Lookups of existing series only ever take shared locks: an exclusive lock is taken on the name map when a
/// name is first seen, and on an entry when a tag set is first seen. Counter and gauge updates are lock-free once the
/// series exists, and histogram updates lock only their own series.
///
/// Time is read from a [`quanta::Clock`], which can be mocked to drive expiry deterministically.
pub struct AggregationStore {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    buckets: HistogramBuckets,
    clock: Clock,
    epoch: Instant,
}

impl AggregationStore {
    /// Creates a new `AggregationStore` with the given histogram bucket configuration, reading time from `clock`.
    pub fn new(buckets: HistogramBuckets, clock: Clock) -> Self {
        let epoch = clock.now();
        Self { entries: RwLock::new(HashMap::new()), buckets, clock, epoch }
    }

    /// Returns the clock used to timestamp updates.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn lookup_or_create(&self, kind: MetricKind, name: &str) -> Arc<Entry> {
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(name) {
                if entry.kind() == kind && !entry.is_retired() {
                    return Arc::clone(entry);
                }
            }
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            if existing.kind() == kind && !existing.is_retired() {
                return Arc::clone(existing);
            }
            if existing.kind() != kind {
                warn!(
                    metric = name,
                    from = existing.kind().as_str(),
                    to = kind.as_str(),
                    "Metric changed kind; discarding previous series."
                );
                existing.retire();
            }
        }

        let entry = Arc::new(Entry::new(kind, name.to_string(), self.buckets_for(kind, name)));
        entries.insert(name.to_string(), Arc::clone(&entry));
        entry
    }

    fn buckets_for(&self, kind: MetricKind, name: &str) -> Option<Arc<[f64]>> {
        match kind {
            MetricKind::Histogram => self.buckets.bounds_for(name),
            MetricKind::Counter | MetricKind::Gauge => None,
        }
    }

    /// Applies `value` to the series for `key` using the default rule for its kind.
    ///
    /// Counters are summed, gauges are replaced, and histograms record an observation.
    pub fn record(&self, key: &MetricKey, value: f64) {
        let op = match key.kind() {
            MetricKind::Counter => Operation::Add,
            MetricKind::Gauge => Operation::Set,
            MetricKind::Histogram => Operation::Observe,
        };
        self.apply(key, op, value);
    }

    /// Applies `value` to the series for `key` using an explicit operation.
    ///
    /// `Add` sums into counters and gauges, `Set` replaces their value, and histograms treat every operation as an
    /// observation.
    pub fn apply(&self, key: &MetricKey, op: Operation, value: f64) {
        let at = self.nanos_since_epoch(self.clock.now());
        loop {
            let entry = self.lookup_or_create(key.kind(), key.name());
            if entry.update(key.tags(), key.tags_hash(), op, value, at) {
                return;
            }
        }
    }

    /// Collects a point-in-time copy of every live series.
    ///
    /// The name map is only locked long enough to copy out the entries, so writers are never blocked for the duration
    /// of a full collection.
    pub fn collect(&self) -> Vec<Sample> {
        let entries = self.entries.read().values().cloned().collect::<Vec<_>>();

        let mut samples = Vec::new();
        for entry in entries {
            entry.for_each_series(|series| {
                samples.push(Sample {
                    key: MetricKey::new(entry.kind(), entry.name(), series.tags()),
                    state: series.state(entry.kind()),
                    last_update: self.epoch + Duration::from_nanos(series.last_update()),
                });
            });
        }
        samples
    }

    /// Removes every series that has not been updated since `older_than`.
    ///
    /// Entries left without any series are removed from the store. Returns the number of series removed.
    pub fn expire(&self, older_than: Instant) -> usize {
        let threshold = self.nanos_since_epoch(older_than);
        let entries = self.entries.read().values().cloned().collect::<Vec<_>>();

        let mut removed = 0;
        let mut retired = Vec::new();
        for entry in entries {
            removed += entry.expire(threshold);
            if entry.is_retired() {
                retired.push(entry);
            }
        }

        if !retired.is_empty() {
            let mut map = self.entries.write();
            for entry in &retired {
                // A writer may already have replaced the retired entry.
                if map.get(entry.name()).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                    map.remove(entry.name());
                }
            }
        }

        if removed > 0 {
            debug!(series = removed, entries = retired.len(), "Expired idle series.");
        }
        removed
    }

    /// Removes every series that has been idle for longer than `timeout`.
    ///
    /// Returns the number of series removed.
    pub fn expire_idle(&self, timeout: Duration) -> usize {
        match self.clock.now().checked_sub(timeout) {
            Some(older_than) => self.expire(older_than),
            None => 0,
        }
    }

    /// Returns the number of distinct metric names held.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the store holds no metrics.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn nanos_since_epoch(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.epoch).as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new(HistogramBuckets::default(), Clock::new())
    }
}

impl std::fmt::Debug for AggregationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationStore").field("metrics", &self.len()).finish_non_exhaustive()
    }
}
