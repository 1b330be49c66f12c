use crate::{
    error::Error,
    key::{MetricKey, MetricKind, Tag},
    pipeline::Pipeline,
    queue::Operation,
};

/// Entry point for streaming metrics through a [`Pipeline`].
///
/// Handles returned from a client compute their metric identity once, so they should be created once per call site and
/// reused rather than recreated on every update.
#[derive(Clone, Debug)]
pub struct Client {
    pipeline: Pipeline,
}

impl Client {
    /// Creates a new `Client` sending through `pipeline`.
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Returns the underlying pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns a handle to the counter with the given name and tags.
    pub fn counter<N, I, T>(&self, name: N, tags: I) -> Counter
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Counter { key: MetricKey::new(MetricKind::Counter, name, tags), pipeline: self.pipeline.clone() }
    }

    /// Returns a handle to the gauge with the given name and tags.
    pub fn gauge<N, I, T>(&self, name: N, tags: I) -> Gauge
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Gauge { key: MetricKey::new(MetricKind::Gauge, name, tags), pipeline: self.pipeline.clone() }
    }

    /// Returns a handle to the histogram with the given name and tags.
    pub fn histogram<N, I, T>(&self, name: N, tags: I) -> Histogram
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Histogram { key: MetricKey::new(MetricKind::Histogram, name, tags), pipeline: self.pipeline.clone() }
    }

    /// Writes everything recorded so far. See [`Pipeline::flush`].
    ///
    /// # Errors
    ///
    /// If the pipeline is closed, or the flush fails, an error is returned.
    pub fn flush(&self) -> Result<(), Error> {
        self.pipeline.flush()
    }

    /// Closes the underlying pipeline. See [`Pipeline::close`].
    ///
    /// # Errors
    ///
    /// If the final write failed, an error is returned.
    pub fn close(&self) -> Result<(), Error> {
        self.pipeline.close()
    }
}

/// A streamed counter.
#[derive(Clone, Debug)]
pub struct Counter {
    key: MetricKey,
    pipeline: Pipeline,
}

impl Counter {
    /// Adds `value` to the counter.
    pub fn add(&self, value: f64) {
        self.pipeline.send(&self.key, Operation::Add, value);
    }

    /// Adds one to the counter.
    pub fn increment(&self) {
        self.add(1.0);
    }

    /// Returns the identity of the counter.
    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}

/// A streamed gauge.
#[derive(Clone, Debug)]
pub struct Gauge {
    key: MetricKey,
    pipeline: Pipeline,
}

impl Gauge {
    /// Sets the gauge to `value`.
    pub fn set(&self, value: f64) {
        self.pipeline.send(&self.key, Operation::Set, value);
    }

    /// Returns the identity of the gauge.
    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}

/// A streamed histogram.
#[derive(Clone, Debug)]
pub struct Histogram {
    key: MetricKey,
    pipeline: Pipeline,
}

impl Histogram {
    /// Records an observation.
    pub fn observe(&self, value: f64) {
        self.pipeline.send(&self.key, Operation::Observe, value);
    }

    /// Returns the identity of the histogram.
    pub fn key(&self) -> &MetricKey {
        &self.key
    }
}
