use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use metrics_pipeline::{Aggregator, BatchWriter, MetricKey, MetricState, Pipeline, Sample};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    builder::BuildError,
    protocol::DogStatsDProtocol,
    telemetry::{Telemetry, TelemetryUpdate},
};

const REPORTER_THREAD_NAME: &str = "metrics-exporter-dogstatsd-reporter";

/// Periodically exports aggregated metrics, and the exporter's own telemetry, to the pipeline.
pub(crate) struct Reporter {
    pipeline: Pipeline,
    protocol: DogStatsDProtocol,
    batches: BatchWriter,
    aggregator: Option<Aggregator>,
    last_counters: HashMap<MetricKey, f64>,
    telemetry: Option<Telemetry>,
}

impl Reporter {
    pub fn new(
        pipeline: Pipeline,
        protocol: DogStatsDProtocol,
        aggregator: Option<Aggregator>,
        telemetry: Option<Telemetry>,
    ) -> Self {
        let batches = pipeline.batch_writer();
        Self { pipeline, protocol, batches, aggregator, last_counters: HashMap::new(), telemetry }
    }

    /// Exports one report.
    ///
    /// Counters are reported as the change since the previous report, and skipped when unchanged. Gauges and
    /// histograms are reported as their current state.
    pub fn report(&mut self) {
        let mut update = TelemetryUpdate::default();

        let samples = match self.aggregator.as_ref().map(Aggregator::collect) {
            Some(collected) => self.deltas(collected, &mut update),
            None => Vec::new(),
        };

        if !samples.is_empty() {
            let exported = self.pipeline.export(&samples, &self.protocol, &self.batches);
            update.points = exported as u64;
            trace!(samples = samples.len(), exported, "Reported aggregated metrics.");
        }

        if let Some(telemetry) = self.telemetry.as_mut() {
            telemetry.report(&self.pipeline, &self.protocol, &self.batches, &update);
        }
    }

    fn deltas(&mut self, collected: Vec<Sample>, update: &mut TelemetryUpdate) -> Vec<Sample> {
        // Counters that expired from the store drop out of the map, and start from zero if they come back.
        let mut counters = HashMap::with_capacity(self.last_counters.len());
        let mut samples = Vec::with_capacity(collected.len());

        for sample in collected {
            match sample.state {
                MetricState::Counter(total) => {
                    update.counter_contexts += 1;
                    let last = self.last_counters.get(&sample.key).copied().unwrap_or(0.0);
                    counters.insert(sample.key.clone(), total);

                    // A total lower than the last one means the counter was reset with an absolute value.
                    let delta = if total >= last { total - last } else { total };
                    if delta != 0.0 {
                        samples.push(Sample { state: MetricState::Counter(delta), ..sample });
                    }
                }
                MetricState::Gauge(_) => {
                    update.gauge_contexts += 1;
                    samples.push(sample);
                }
                MetricState::Histogram(_) => {
                    update.histogram_contexts += 1;
                    samples.push(sample);
                }
            }
        }

        self.last_counters = counters;
        samples
    }
}

/// Owns the reporter thread.
///
/// Dropping the handle stops the thread after one last report, without waiting for it.
pub(crate) struct ReporterHandle {
    reporter: Arc<Mutex<Reporter>>,
    stop: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReporterHandle {
    pub fn spawn(reporter: Reporter, interval: Duration) -> Result<Self, BuildError> {
        let reporter = Arc::new(Mutex::new(reporter));
        let (stop_tx, stop_rx) = bounded(0);

        let thread = {
            let reporter = Arc::clone(&reporter);
            thread::Builder::new()
                .name(REPORTER_THREAD_NAME.to_string())
                .spawn(move || run(&reporter, interval, &stop_rx))
                .map_err(BuildError::Backend)?
        };

        Ok(Self { reporter, stop: Mutex::new(Some(stop_tx)), thread: Mutex::new(Some(thread)) })
    }

    /// Reports immediately, on the calling thread.
    pub fn report_now(&self) {
        self.reporter.lock().report();
    }

    /// Stops the reporter thread, waiting for its last report.
    pub fn stop(&self) {
        self.stop.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn run(reporter: &Mutex<Reporter>, interval: Duration, stop: &Receiver<()>) {
    debug!(?interval, "Reporter started.");
    loop {
        select! {
            recv(stop) -> _ => break,
            default(interval) => reporter.lock().report(),
        }
    }

    reporter.lock().report();
    debug!("Reporter stopped.");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_pipeline::{AggregatorBuilder, PipelineBuilder, Tag};

    use super::{Reporter, ReporterHandle};
    use crate::{protocol::DogStatsDProtocol, telemetry::Telemetry, test_util::UdpServer};

    fn sorted(mut lines: Vec<String>) -> Vec<String> {
        lines.sort();
        lines
    }

    #[test]
    fn reports_counter_deltas_and_current_levels() {
        let server = UdpServer::new();
        let pipeline = PipelineBuilder::new().build(server.dialer(), DogStatsDProtocol::new()).unwrap();
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();
        let mut reporter = Reporter::new(pipeline.clone(), DogStatsDProtocol::new(), Some(aggregator.clone()), None);

        let hits = aggregator.counter("hits", Vec::<Tag>::new());
        let depth = aggregator.gauge("depth", Vec::<Tag>::new());
        hits.add(3.0);
        hits.add(4.0);
        depth.set(2.5);

        reporter.report();
        pipeline.flush().unwrap();
        assert_eq!(sorted(server.receive_lines(2)), vec!["depth:2.5|g", "hits:7|c"]);

        hits.increment();
        reporter.report();
        pipeline.flush().unwrap();
        assert_eq!(sorted(server.receive_lines(2)), vec!["depth:2.5|g", "hits:1|c"]);

        // Unchanged counters are skipped, and a lower absolute total counts from zero.
        reporter.report();
        pipeline.flush().unwrap();
        assert_eq!(server.receive_lines(1), vec!["depth:2.5|g"]);

        hits.absolute(5.0);
        reporter.report();
        pipeline.flush().unwrap();
        assert_eq!(sorted(server.receive_lines(2)), vec!["depth:2.5|g", "hits:5|c"]);

        pipeline.close().unwrap();
    }

    #[test]
    fn reports_telemetry() {
        let server = UdpServer::new();
        let pipeline = PipelineBuilder::new().build(server.dialer(), DogStatsDProtocol::new()).unwrap();
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();
        let mut reporter = Reporter::new(
            pipeline.clone(),
            DogStatsDProtocol::new(),
            Some(aggregator.clone()),
            Some(Telemetry::new("udp")),
        );

        aggregator.counter("hits", Vec::<Tag>::new()).increment();
        aggregator.gauge("depth", Vec::<Tag>::new()).set(1.0);
        reporter.report();
        pipeline.flush().unwrap();

        let lines = server.receive_lines(12);
        let tags = format!("client:rust,client_version:{},client_transport:udp", env!("CARGO_PKG_VERSION"));
        assert!(lines.contains(&format!("datadog.dogstatsd.client.metrics:2|c|#{tags}")));
        assert!(lines.contains(&format!("datadog.dogstatsd.client.aggregated_context:2|c|#{tags}")));
        assert!(lines.contains(&format!("datadog.dogstatsd.client.aggregated_context_by_type:1|c|#{tags},metrics_type:gauge")));
        assert!(lines.contains(&format!("datadog.dogstatsd.client.packets_dropped_queue:0|c|#{tags}")));

        pipeline.close().unwrap();
    }

    #[test]
    fn stopping_reports_one_last_time() {
        let server = UdpServer::new();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(Duration::from_millis(10))
            .build(server.dialer(), DogStatsDProtocol::new())
            .unwrap();
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();
        let reporter = Reporter::new(pipeline.clone(), DogStatsDProtocol::new(), Some(aggregator.clone()), None);
        let handle = ReporterHandle::spawn(reporter, Duration::from_secs(3600)).unwrap();

        aggregator.counter("hits", Vec::<Tag>::new()).add(2.0);
        handle.stop();
        handle.stop();

        pipeline.close().unwrap();
        assert_eq!(server.receive_lines(1), vec!["hits:2|c"]);
    }
}
