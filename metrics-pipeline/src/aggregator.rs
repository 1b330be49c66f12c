use std::{sync::Arc, thread, time::Duration};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use quanta::Clock;
use tracing::debug;

use crate::{
    buffer::BatchWriter,
    error::BuildError,
    key::{MetricKey, MetricKind, Tag},
    pipeline::Pipeline,
    protocol::Serializer,
    queue::Operation,
    store::{AggregationStore, HistogramBuckets, Matcher, Sample},
};

/// Default time after which a series that has not been updated is removed.
pub const DEFAULT_EXPIRE_TIMEOUT: Duration = Duration::from_secs(600);

const SWEEPER_THREAD_NAME: &str = "metrics-pipeline-expiry";

/// Builder for an [`Aggregator`].
pub struct AggregatorBuilder {
    expire_timeout: Option<Duration>,
    buckets: HistogramBuckets,
    clock: Clock,
}

impl AggregatorBuilder {
    /// Creates a new `AggregatorBuilder` with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a series may go without updates before it is removed.
    ///
    /// A background thread checks for idle series every half timeout. `None` disables expiry, and so does a zero
    /// timeout, since every series would be idle as soon as it was written.
    ///
    /// Defaults to 10 minutes.
    #[must_use]
    pub fn with_expire_timeout(mut self, expire_timeout: Option<Duration>) -> Self {
        self.expire_timeout = expire_timeout.filter(|t| !t.is_zero());
        self
    }

    /// Sets the bucket bounds for histograms without a more specific override.
    ///
    /// Without any bounds, histograms track only their count and sum.
    ///
    /// # Errors
    ///
    /// If `bounds` is empty, not strictly ascending, or contains a non-finite value, an error is returned.
    pub fn with_buckets(mut self, bounds: &[f64]) -> Result<Self, BuildError> {
        self.buckets = self.buckets.with_default(bounds)?;
        Ok(self)
    }

    /// Sets the bucket bounds for histograms whose name matches `matcher`.
    ///
    /// A full match wins over a prefix match, which wins over a suffix match.
    ///
    /// # Errors
    ///
    /// If `bounds` is empty, not strictly ascending, or contains a non-finite value, an error is returned.
    pub fn with_buckets_for_metric(mut self, matcher: Matcher, bounds: &[f64]) -> Result<Self, BuildError> {
        self.buckets = self.buckets.with_override(matcher, bounds)?;
        Ok(self)
    }

    /// Sets the clock used to timestamp updates and judge idleness.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the aggregator, spawning the expiry thread if expiry is enabled.
    ///
    /// # Errors
    ///
    /// If the expiry thread cannot be spawned, an error is returned.
    pub fn build(self) -> Result<Aggregator, BuildError> {
        let store = Arc::new(AggregationStore::new(self.buckets, self.clock));

        let sweeper = match self.expire_timeout {
            Some(timeout) => Some(Sweeper::spawn(Arc::clone(&store), timeout)?),
            None => None,
        };

        Ok(Aggregator { store, sweeper: sweeper.map(Arc::new) })
    }
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self { expire_timeout: Some(DEFAULT_EXPIRE_TIMEOUT), buckets: HistogramBuckets::default(), clock: Clock::new() }
    }
}

struct Sweeper {
    // Dropping the sender wakes the thread up and stops it.
    _stop: Sender<()>,
}

impl Sweeper {
    fn spawn(store: Arc<AggregationStore>, timeout: Duration) -> Result<Self, BuildError> {
        let (stop_tx, stop_rx) = bounded(0);
        thread::Builder::new()
            .name(SWEEPER_THREAD_NAME.to_string())
            .spawn(move || sweep(&store, timeout, &stop_rx))
            .map_err(|source| BuildError::Backend { name: SWEEPER_THREAD_NAME, source })?;
        Ok(Self { _stop: stop_tx })
    }
}

fn sweep(store: &AggregationStore, timeout: Duration, stop: &Receiver<()>) {
    let interval = timeout / 2;
    loop {
        select! {
            recv(stop) -> _ => break,
            default(interval) => {
                store.expire_idle(timeout);
            }
        }
    }
    debug!("Expiry thread stopped.");
}

/// In-process aggregation of metrics, for periodic export.
///
/// Updates are folded into an [`AggregationStore`] instead of being streamed one by one. Handles compute their metric
/// identity once, so they should be created once per call site and reused.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<AggregationStore>,
    sweeper: Option<Arc<Sweeper>>,
}

impl Aggregator {
    /// Creates a new `Aggregator` with the default configuration.
    ///
    /// # Errors
    ///
    /// If the expiry thread cannot be spawned, an error is returned.
    pub fn new() -> Result<Self, BuildError> {
        AggregatorBuilder::default().build()
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    /// Returns a handle to the counter with the given name and tags.
    pub fn counter<N, I, T>(&self, name: N, tags: I) -> AggregatedCounter
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        AggregatedCounter(self.handle(MetricKind::Counter, name, tags))
    }

    /// Returns a handle to the gauge with the given name and tags.
    pub fn gauge<N, I, T>(&self, name: N, tags: I) -> AggregatedGauge
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        AggregatedGauge(self.handle(MetricKind::Gauge, name, tags))
    }

    /// Returns a handle to the histogram with the given name and tags.
    pub fn histogram<N, I, T>(&self, name: N, tags: I) -> AggregatedHistogram
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        AggregatedHistogram(self.handle(MetricKind::Histogram, name, tags))
    }

    /// Returns a handle to the metric identified by `key`.
    pub fn handle_for(&self, key: MetricKey) -> Handle {
        Handle { key, store: Arc::clone(&self.store) }
    }

    fn handle<N, I, T>(&self, kind: MetricKind, name: N, tags: I) -> Handle
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.handle_for(MetricKey::new(kind, name, tags))
    }

    /// Collects a point-in-time copy of every live series.
    pub fn collect(&self) -> Vec<Sample> {
        self.store.collect()
    }

    /// Collects every live series, serializes it, and hands the payloads to `pipeline`.
    ///
    /// Returns the number of samples exported.
    pub fn export<S>(&self, pipeline: &Pipeline, serializer: &S, batches: &BatchWriter) -> usize
    where
        S: Serializer + ?Sized,
    {
        pipeline.export(&self.collect(), serializer, batches)
    }

    /// Returns `true` if idle series are being expired in the background.
    pub fn expires_idle(&self) -> bool {
        self.sweeper.is_some()
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator").field("store", &self.store).field("expires_idle", &self.expires_idle()).finish()
    }
}

/// A handle applying updates to one series in an [`AggregationStore`].
#[derive(Clone, Debug)]
pub struct Handle {
    key: MetricKey,
    store: Arc<AggregationStore>,
}

impl Handle {
    /// Applies `value` with an explicit operation.
    pub fn apply(&self, operation: Operation, value: f64) {
        self.store.apply(&self.key, operation, value);
    }

    /// Returns the identity of the series.
    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}

/// An aggregated counter.
#[derive(Clone, Debug)]
pub struct AggregatedCounter(Handle);

impl AggregatedCounter {
    /// Adds `value` to the counter.
    pub fn add(&self, value: f64) {
        self.0.apply(Operation::Add, value);
    }

    /// Adds one to the counter.
    pub fn increment(&self) {
        self.add(1.0);
    }

    /// Sets the counter to an absolute total.
    pub fn absolute(&self, value: f64) {
        self.0.apply(Operation::Set, value);
    }

    /// Returns the identity of the counter.
    pub fn key(&self) -> &MetricKey {
        self.0.key()
    }
}

/// An aggregated gauge.
#[derive(Clone, Debug)]
pub struct AggregatedGauge(Handle);

impl AggregatedGauge {
    /// Sets the gauge to `value`.
    pub fn set(&self, value: f64) {
        self.0.apply(Operation::Set, value);
    }

    /// Adds `delta` to the gauge.
    pub fn add(&self, delta: f64) {
        self.0.apply(Operation::Add, delta);
    }

    /// Returns the identity of the gauge.
    pub fn key(&self) -> &MetricKey {
        self.0.key()
    }
}

/// An aggregated histogram.
#[derive(Clone, Debug)]
pub struct AggregatedHistogram(Handle);

impl AggregatedHistogram {
    /// Records an observation.
    pub fn observe(&self, value: f64) {
        self.0.apply(Operation::Observe, value);
    }

    /// Returns the identity of the histogram.
    pub fn key(&self) -> &MetricKey {
        self.0.key()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use quanta::Clock;

    use super::AggregatorBuilder;
    use crate::store::{Matcher, MetricState};

    #[test]
    fn handles_update_the_store() {
        let aggregator = AggregatorBuilder::new()
            .with_expire_timeout(None)
            .with_buckets(&[1.0, 10.0])
            .unwrap()
            .with_buckets_for_metric(Matcher::Prefix("db.".to_string()), &[100.0])
            .unwrap()
            .build()
            .unwrap();
        assert!(!aggregator.expires_idle());

        let hits = aggregator.counter("hits", [("route", "/")]);
        hits.increment();
        hits.add(2.0);

        let depth = aggregator.gauge("depth", [("queue", "a")]);
        depth.set(10.0);
        depth.add(-4.0);

        aggregator.histogram("latency", [("op", "get")]).observe(5.0);
        aggregator.histogram("db.latency", [("op", "get")]).observe(5.0);

        let mut samples = aggregator.collect();
        samples.sort_by(|a, b| a.key.encoded().cmp(b.key.encoded()));
        assert_eq!(samples.len(), 4);

        assert_eq!(samples[0].key.name(), "db.latency");
        let MetricState::Histogram(db) = &samples[0].state else { panic!("expected histogram") };
        assert_eq!(db.bucket_counts(), &[1]);

        assert_eq!(samples[1].state, MetricState::Gauge(6.0));
        assert_eq!(samples[2].state, MetricState::Counter(3.0));

        let MetricState::Histogram(latency) = &samples[3].state else { panic!("expected histogram") };
        assert_eq!(latency.bucket_counts(), &[0, 1]);
    }

    #[test]
    fn absolute_counters_replace() {
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();
        let total = aggregator.counter("bytes", [("dir", "in")]);
        total.absolute(100.0);
        total.absolute(250.0);
        assert_eq!(aggregator.collect()[0].state, MetricState::Counter(250.0));
    }

    #[test]
    fn zero_expire_timeout_disables_expiry() {
        let aggregator = AggregatorBuilder::new().with_expire_timeout(Some(Duration::ZERO)).build().unwrap();
        assert!(!aggregator.expires_idle());

        aggregator.gauge("temperature", [("room", "a")]).set(20.0);
        assert_eq!(aggregator.collect().len(), 1);
    }

    #[test]
    fn sweeper_expires_idle_series() {
        let (clock, mock) = Clock::mock();
        let timeout = Duration::from_millis(40);
        let aggregator =
            AggregatorBuilder::new().with_clock(clock).with_expire_timeout(Some(timeout)).build().unwrap();
        assert!(aggregator.expires_idle());

        mock.increment(timeout * 2);
        aggregator.gauge("temperature", [("room", "a")]).set(20.0);
        assert_eq!(aggregator.collect().len(), 1);

        // The sweeper runs on real time, and judges idleness by the mock clock.
        mock.increment(timeout * 2);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !aggregator.collect().is_empty() {
            assert!(std::time::Instant::now() < deadline, "series was never expired");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
