use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_pipeline::{Aggregator, ConnectionState, Error, Pipeline, Stats};
use metrics_util::registry::Registry;

use crate::{reporter::ReporterHandle, storage::HandleStorage};

/// Where recorded values go.
pub(crate) enum Sink {
    /// Every update is sent as its own line.
    Streaming(Pipeline),

    /// Updates are folded into an aggregator, and reported periodically.
    Aggregated { aggregator: Aggregator },
}

/// Exporter state.
pub(crate) struct State {
    registry: Registry<Key, HandleStorage>,
    pipeline: Pipeline,
    reporter: Option<ReporterHandle>,
}

impl State {
    pub fn new(sink: Sink, pipeline: Pipeline, reporter: Option<ReporterHandle>) -> Self {
        Self { registry: Registry::new(HandleStorage::new(sink)), pipeline, reporter }
    }

    fn flush(&self) -> Result<(), Error> {
        if self.pipeline.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(reporter) = &self.reporter {
            reporter.report_now();
        }
        self.pipeline.flush()
    }

    fn shutdown(&self) -> Result<(), Error> {
        if let Some(reporter) = &self.reporter {
            reporter.stop();
        }
        self.pipeline.close()
    }
}

/// A recorder that forwards metrics to a DogStatsD server.
pub struct DogStatsDRecorder {
    state: Arc<State>,
}

impl DogStatsDRecorder {
    pub(crate) fn new(state: Arc<State>) -> Self {
        DogStatsDRecorder { state }
    }

    /// Returns a handle for flushing and shutting down the exporter.
    ///
    /// The handle stays usable after the recorder itself is installed globally.
    pub fn handle(&self) -> DogStatsDHandle {
        DogStatsDHandle { state: Arc::clone(&self.state) }
    }
}

impl Recorder for DogStatsDRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.state.registry.get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.state.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.state.registry.get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}

/// Handle to a running exporter.
#[derive(Clone)]
pub struct DogStatsDHandle {
    state: Arc<State>,
}

impl DogStatsDHandle {
    /// Sends everything recorded so far, waiting for the result.
    ///
    /// In aggregated mode this reports immediately rather than waiting for the next flush interval.
    ///
    /// # Errors
    ///
    /// If the exporter was shut down, or the server could not be reached or written to, an error is returned.
    pub fn flush(&self) -> Result<(), Error> {
        self.state.flush()
    }

    /// Stops the exporter, sending everything recorded so far.
    ///
    /// Metrics recorded afterwards are dropped. Shutting down more than once is harmless.
    ///
    /// # Errors
    ///
    /// If the last write before shutdown failed, that error is returned.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.state.shutdown()
    }

    /// Returns the current state of the connection to the server.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.pipeline.state()
    }

    /// Returns counters describing the exporter's activity so far.
    pub fn stats(&self) -> Stats {
        self.state.pipeline.stats()
    }
}

impl std::fmt::Debug for DogStatsDHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DogStatsDHandle").field("pipeline", &self.state.pipeline).finish_non_exhaustive()
    }
}
