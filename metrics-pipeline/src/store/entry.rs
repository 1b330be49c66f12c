use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::buckets::{HistogramSnapshot, HistogramState};
use crate::{
    atomic::{AtomicU64, AtomicValue},
    key::{MetricKind, Tag},
    queue::Operation,
};

/// Current aggregated state of one series.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricState {
    /// Accumulated counter total.
    Counter(f64),

    /// Last gauge value.
    Gauge(f64),

    /// Histogram count, sum, and buckets.
    Histogram(HistogramSnapshot),
}

enum Cell {
    Scalar(AtomicValue),
    Histogram(Mutex<HistogramState>),
}

pub(crate) struct Series {
    tags: Vec<Tag>,
    cell: Cell,
    // Nanoseconds since the store epoch.
    last_update: AtomicU64,
}

impl Series {
    fn new(kind: MetricKind, tags: Vec<Tag>, bounds: Option<&Arc<[f64]>>, at: u64) -> Self {
        let cell = match kind {
            MetricKind::Counter | MetricKind::Gauge => Cell::Scalar(AtomicValue::default()),
            MetricKind::Histogram => Cell::Histogram(Mutex::new(HistogramState::new(bounds.cloned()))),
        };
        Self { tags, cell, last_update: AtomicU64::new(at) }
    }

    fn apply(&self, op: Operation, value: f64, at: u64) {
        match &self.cell {
            Cell::Scalar(scalar) => match op {
                Operation::Add => {
                    scalar.add(value);
                }
                Operation::Set | Operation::Observe => {
                    scalar.set(value);
                }
            },
            Cell::Histogram(histogram) => histogram.lock().observe(value),
        }
        self.last_update.fetch_max(at, Ordering::AcqRel);
    }

    pub(crate) fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub(crate) fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self, kind: MetricKind) -> MetricState {
        match (&self.cell, kind) {
            (Cell::Scalar(scalar), MetricKind::Counter) => MetricState::Counter(scalar.read()),
            (Cell::Scalar(scalar), _) => MetricState::Gauge(scalar.read()),
            (Cell::Histogram(histogram), _) => MetricState::Histogram(histogram.lock().snapshot()),
        }
    }
}

/// Every series of one metric name and kind.
///
/// Series are bucketed by the hash of their tags. A bucket holds more than one series only when distinct tag sets
/// collide, in which case the tags themselves are compared.
pub(crate) struct Entry {
    kind: MetricKind,
    name: String,
    bounds: Option<Arc<[f64]>>,
    series: RwLock<HashMap<u64, Vec<Series>>>,
    // Set once the entry is emptied by expiry and about to be unlinked from the store. Writers that lose this race
    // look the entry up again.
    retired: AtomicBool,
}

impl Entry {
    pub(crate) fn new(kind: MetricKind, name: String, bounds: Option<Arc<[f64]>>) -> Self {
        Self { kind, name, bounds, series: RwLock::new(HashMap::new()), retired: AtomicBool::new(false) }
    }

    pub(crate) fn kind(&self) -> MetricKind {
        self.kind
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Applies an update to the series for `tags`, creating it if necessary.
    ///
    /// Returns `false` if the entry was retired, in which case nothing was applied.
    pub(crate) fn update(&self, tags: &[Tag], tags_hash: u64, op: Operation, value: f64, at: u64) -> bool {
        {
            let series = self.series.read();
            if self.is_retired() {
                return false;
            }
            if let Some(existing) = find(&series, tags, tags_hash) {
                existing.apply(op, value, at);
                return true;
            }
        }

        let mut series = self.series.write();
        if self.is_retired() {
            return false;
        }

        let bucket = series.entry(tags_hash).or_default();
        let idx = match bucket.iter().position(|s| s.tags == tags) {
            Some(idx) => idx,
            None => {
                bucket.push(Series::new(self.kind, tags.to_vec(), self.bounds.as_ref(), at));
                bucket.len() - 1
            }
        };
        bucket[idx].apply(op, value, at);
        true
    }

    /// Calls `f` with every series, under a shared lock.
    pub(crate) fn for_each_series<F>(&self, mut f: F)
    where
        F: FnMut(&Series),
    {
        let series = self.series.read();
        series.values().flatten().for_each(|s| f(s));
    }

    /// Removes every series last updated before `threshold`.
    ///
    /// Returns the number of series removed. If no series remain, the entry is retired and must be unlinked from the
    /// store.
    pub(crate) fn expire(&self, threshold: u64) -> usize {
        let mut series = self.series.write();
        let mut removed = 0;
        series.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|s| s.last_update() >= threshold);
            removed += before - bucket.len();
            !bucket.is_empty()
        });

        if series.is_empty() {
            self.retired.store(true, Ordering::Release);
        }
        removed
    }

    /// Retires the entry, so that any concurrent writer retries against its replacement.
    pub(crate) fn retire(&self) {
        let _series = self.series.write();
        self.retired.store(true, Ordering::Release);
    }
}

fn find<'a>(series: &'a HashMap<u64, Vec<Series>>, tags: &[Tag], tags_hash: u64) -> Option<&'a Series> {
    series.get(&tags_hash).and_then(|bucket| bucket.iter().find(|s| s.tags == tags))
}
