use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering::AcqRel},
    Arc,
};

use metrics::{CounterFn, GaugeFn, HistogramFn, Key};
use metrics_pipeline::{AtomicValue, Handle, MetricKey, MetricKind, Operation, Pipeline, Tag};
use metrics_util::registry::Storage;

use crate::recorder::Sink;

/// Converts a `metrics` key into the pipeline's identity for the same series.
pub(crate) fn metric_key(kind: MetricKind, key: &Key) -> MetricKey {
    let tags = key.labels().map(|label| Tag::new(label.key().to_owned(), label.value().to_owned()));
    MetricKey::new(kind, key.name(), tags)
}

/// A counter that streams every update.
///
/// DogStatsD counts are deltas, so absolute values are turned into the difference from the previous absolute value.
/// The first absolute value only sets the baseline.
pub(crate) struct StreamingCounter {
    key: MetricKey,
    pipeline: Pipeline,
    is_absolute: AtomicBool,
    last: AtomicU64,
}

impl StreamingCounter {
    fn new(key: MetricKey, pipeline: Pipeline) -> Self {
        Self { key, pipeline, is_absolute: AtomicBool::new(false), last: AtomicU64::new(0) }
    }
}

impl CounterFn for StreamingCounter {
    fn increment(&self, value: u64) {
        self.pipeline.send(&self.key, Operation::Add, value as f64);
    }

    fn absolute(&self, value: u64) {
        let last = self.last.swap(value, AcqRel);
        if !self.is_absolute.swap(true, AcqRel) {
            return;
        }

        // A value lower than the last one means the source restarted: count from zero again.
        let delta = if value >= last { value - last } else { value };
        if delta > 0 {
            self.pipeline.send(&self.key, Operation::Add, delta as f64);
        }
    }
}

/// A gauge that streams its value after every update.
///
/// DogStatsD gauges only carry absolute values, so increments are applied to a local copy first.
pub(crate) struct StreamingGauge {
    key: MetricKey,
    pipeline: Pipeline,
    value: AtomicValue,
}

impl StreamingGauge {
    fn new(key: MetricKey, pipeline: Pipeline) -> Self {
        Self { key, pipeline, value: AtomicValue::default() }
    }
}

impl GaugeFn for StreamingGauge {
    fn increment(&self, value: f64) {
        let current = self.value.add(value);
        self.pipeline.send(&self.key, Operation::Set, current);
    }

    fn decrement(&self, value: f64) {
        let current = self.value.add(-value);
        self.pipeline.send(&self.key, Operation::Set, current);
    }

    fn set(&self, value: f64) {
        self.value.set(value);
        self.pipeline.send(&self.key, Operation::Set, value);
    }
}

pub(crate) struct StreamingHistogram {
    key: MetricKey,
    pipeline: Pipeline,
}

impl HistogramFn for StreamingHistogram {
    fn record(&self, value: f64) {
        self.pipeline.send(&self.key, Operation::Observe, value);
    }
}

pub(crate) enum CounterHandle {
    Streaming(StreamingCounter),
    Aggregated(Handle),
}

impl CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        match self {
            CounterHandle::Streaming(counter) => counter.increment(value),
            CounterHandle::Aggregated(handle) => handle.apply(Operation::Add, value as f64),
        }
    }

    fn absolute(&self, value: u64) {
        match self {
            CounterHandle::Streaming(counter) => counter.absolute(value),
            CounterHandle::Aggregated(handle) => handle.apply(Operation::Set, value as f64),
        }
    }
}

pub(crate) enum GaugeHandle {
    Streaming(StreamingGauge),
    Aggregated(Handle),
}

impl GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        match self {
            GaugeHandle::Streaming(gauge) => gauge.increment(value),
            GaugeHandle::Aggregated(handle) => handle.apply(Operation::Add, value),
        }
    }

    fn decrement(&self, value: f64) {
        match self {
            GaugeHandle::Streaming(gauge) => gauge.decrement(value),
            GaugeHandle::Aggregated(handle) => handle.apply(Operation::Add, -value),
        }
    }

    fn set(&self, value: f64) {
        match self {
            GaugeHandle::Streaming(gauge) => gauge.set(value),
            GaugeHandle::Aggregated(handle) => handle.apply(Operation::Set, value),
        }
    }
}

pub(crate) enum HistogramHandle {
    Streaming(StreamingHistogram),
    Aggregated(Handle),
}

impl HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        match self {
            HistogramHandle::Streaming(histogram) => histogram.record(value),
            HistogramHandle::Aggregated(handle) => handle.apply(Operation::Observe, value),
        }
    }
}

/// Registry storage creating handles that feed either the pipeline directly or the aggregator.
pub(crate) struct HandleStorage {
    sink: Sink,
}

impl HandleStorage {
    pub fn new(sink: Sink) -> Self {
        Self { sink }
    }
}

impl Storage<Key> for HandleStorage {
    type Counter = Arc<CounterHandle>;
    type Gauge = Arc<GaugeHandle>;
    type Histogram = Arc<HistogramHandle>;

    fn counter(&self, key: &Key) -> Self::Counter {
        let key = metric_key(MetricKind::Counter, key);
        Arc::new(match &self.sink {
            Sink::Streaming(pipeline) => CounterHandle::Streaming(StreamingCounter::new(key, pipeline.clone())),
            Sink::Aggregated { aggregator, .. } => CounterHandle::Aggregated(aggregator.handle_for(key)),
        })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        let key = metric_key(MetricKind::Gauge, key);
        Arc::new(match &self.sink {
            Sink::Streaming(pipeline) => GaugeHandle::Streaming(StreamingGauge::new(key, pipeline.clone())),
            Sink::Aggregated { aggregator, .. } => GaugeHandle::Aggregated(aggregator.handle_for(key)),
        })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        let key = metric_key(MetricKind::Histogram, key);
        Arc::new(match &self.sink {
            Sink::Streaming(pipeline) => {
                HistogramHandle::Streaming(StreamingHistogram { key, pipeline: pipeline.clone() })
            }
            Sink::Aggregated { aggregator, .. } => HistogramHandle::Aggregated(aggregator.handle_for(key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use metrics::{CounterFn, GaugeFn, HistogramFn, Key, Label};
    use metrics_pipeline::{AggregatorBuilder, MetricKind, MetricState, PipelineBuilder};

    use super::{metric_key, CounterHandle, GaugeHandle, HistogramHandle, StreamingCounter, StreamingGauge};
    use crate::{protocol::DogStatsDProtocol, test_util::UdpServer};

    #[test]
    fn keys_carry_sorted_labels() {
        let key = Key::from_parts("requests", vec![Label::new("route", "/"), Label::new("method", "GET")]);
        let converted = metric_key(MetricKind::Counter, &key);
        assert_eq!(converted.name(), "requests");
        assert_eq!(converted.kind(), MetricKind::Counter);
        assert_eq!(converted.encoded(), "requests?method=GET&route=/");
    }

    #[test]
    fn streaming_handles_send_deltas_and_levels() {
        let server = UdpServer::new();
        let pipeline = PipelineBuilder::new()
            .build(server.dialer(), DogStatsDProtocol::new())
            .unwrap();

        let counter = StreamingCounter::new(metric_key(MetricKind::Counter, &Key::from_name("bytes")), pipeline.clone());
        counter.absolute(100);
        counter.absolute(150);
        counter.absolute(150);
        counter.absolute(20);
        assert_eq!(counter.last.load(Ordering::Acquire), 20);
        counter.increment(5);

        let gauge = StreamingGauge::new(metric_key(MetricKind::Gauge, &Key::from_name("depth")), pipeline.clone());
        gauge.increment(3.0);
        gauge.decrement(1.0);
        gauge.set(10.0);

        pipeline.flush().unwrap();
        assert_eq!(
            server.receive_lines(6),
            vec!["bytes:50|c", "bytes:20|c", "bytes:5|c", "depth:3|g", "depth:2|g", "depth:10|g"]
        );
        pipeline.close().unwrap();
    }

    #[test]
    fn aggregated_handles_update_the_store() {
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();

        let counter =
            CounterHandle::Aggregated(aggregator.handle_for(metric_key(MetricKind::Counter, &Key::from_name("hits"))));
        counter.increment(2);
        counter.increment(3);

        let gauge =
            GaugeHandle::Aggregated(aggregator.handle_for(metric_key(MetricKind::Gauge, &Key::from_name("depth"))));
        gauge.set(10.0);
        gauge.decrement(4.0);
        gauge.increment(1.5);

        let histogram = HistogramHandle::Aggregated(
            aggregator.handle_for(metric_key(MetricKind::Histogram, &Key::from_name("latency"))),
        );
        histogram.record(2.0);
        histogram.record(4.0);

        let mut samples = aggregator.collect();
        samples.sort_by(|a, b| a.key.name().cmp(b.key.name()));
        assert_eq!(samples[0].state, MetricState::Gauge(7.5));
        assert_eq!(samples[1].state, MetricState::Counter(5.0));
        let MetricState::Histogram(latency) = &samples[2].state else { panic!("expected histogram") };
        assert_eq!(latency.count(), 2);
        assert_eq!(latency.sum(), 6.0);

        counter.absolute(42);
        let samples = aggregator.collect();
        let hits = samples.iter().find(|s| s.key.name() == "hits").unwrap();
        assert_eq!(hits.state, MetricState::Counter(42.0));
    }
}
