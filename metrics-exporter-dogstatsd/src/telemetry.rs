use metrics_pipeline::{BatchWriter, Pipeline, Stats, Tag};
use tracing::debug;

use crate::protocol::DogStatsDProtocol;

const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exporter telemetry.
///
/// `Telemetry` turns the pipeline's statistics into metrics about the exporter itself, sent to the same DogStatsD server
/// under the `datadog.dogstatsd.client` namespace used by the official clients. Every report sends the change since the
/// previous one, as counts.
pub(crate) struct Telemetry {
    base_tags: Vec<Tag>,
    counter_tags: Vec<Tag>,
    gauge_tags: Vec<Tag>,
    histogram_tags: Vec<Tag>,
    last: Stats,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new(transport: &'static str) -> Self {
        let base_tags = vec![
            Tag::from_static("client", "rust"),
            Tag::from_static("client_version", CLIENT_VERSION),
            Tag::from_static("client_transport", transport),
        ];
        let with_type = |metrics_type: &'static str| {
            let mut tags = base_tags.clone();
            tags.push(Tag::from_static("metrics_type", metrics_type));
            tags
        };

        Self {
            counter_tags: with_type("count"),
            gauge_tags: with_type("gauge"),
            histogram_tags: with_type("histogram"),
            base_tags,
            last: Stats::default(),
        }
    }

    /// Writes the telemetry accumulated since the last report and hands it to `pipeline`.
    pub fn report(
        &mut self,
        pipeline: &Pipeline,
        protocol: &DogStatsDProtocol,
        batches: &BatchWriter,
        update: &TelemetryUpdate,
    ) {
        let stats = pipeline.stats();
        let last = self.last;
        let delta = |field: fn(&Stats) -> u64| field(&stats).saturating_sub(field(&last));

        let points = [
            ("datadog.dogstatsd.client.metrics", &self.base_tags, delta(|s| s.jobs_enqueued) + update.points),
            ("datadog.dogstatsd.client.packets_sent", &self.base_tags, delta(|s| s.flushes)),
            ("datadog.dogstatsd.client.bytes_sent", &self.base_tags, delta(|s| s.bytes_written)),
            ("datadog.dogstatsd.client.bytes_dropped", &self.base_tags, delta(|s| s.bytes_lost)),
            ("datadog.dogstatsd.client.packets_dropped_writer", &self.base_tags, delta(|s| s.write_errors)),
            ("datadog.dogstatsd.client.packets_dropped_queue", &self.base_tags, delta(|s| s.jobs_dropped)),
            ("datadog.dogstatsd.client.aggregated_context", &self.base_tags, update.contexts()),
            ("datadog.dogstatsd.client.aggregated_context_by_type", &self.counter_tags, update.counter_contexts),
            ("datadog.dogstatsd.client.aggregated_context_by_type", &self.gauge_tags, update.gauge_contexts),
            ("datadog.dogstatsd.client.aggregated_context_by_type", &self.histogram_tags, update.histogram_contexts),
        ];

        for (name, tags, value) in points {
            match batches.write_batch(|sink| protocol.write_telemetry(sink, name, value as f64, tags)) {
                Ok(detached) => {
                    for payload in detached {
                        pipeline.send_payload(payload);
                    }
                }
                Err(error) => debug!(%error, metric_name = name, "Failed to build telemetry payload."),
            }
        }
        if let Some(rest) = batches.finish() {
            pipeline.send_payload(rest);
        }

        self.last = stats;
    }
}

/// Per-report counts that only the reporter knows about.
#[derive(Debug, Default)]
pub(crate) struct TelemetryUpdate {
    pub counter_contexts: u64,
    pub gauge_contexts: u64,
    pub histogram_contexts: u64,
    pub points: u64,
}

impl TelemetryUpdate {
    fn contexts(&self) -> u64 {
        self.counter_contexts + self.gauge_contexts + self.histogram_contexts
    }
}
