use std::{net::SocketAddr, sync::Arc, time::Duration};

use metrics_pipeline::{
    AggregatorBuilder, Error, FailCallback, Matcher, NetDialer, PipelineBuilder, RemoteAddr, Tag,
    DEFAULT_EXPIRE_TIMEOUT, DEFAULT_FLUSH_TIMEOUT, DEFAULT_QUEUE_SIZE, DEFAULT_RETRY_AFTER_MAX,
    DEFAULT_RETRY_AFTER_MIN,
};
use thiserror::Error;

use crate::{
    protocol::{DogStatsDProtocol, SMALLEST_VALID_PAYLOAD},
    recorder::{DogStatsDHandle, DogStatsDRecorder, Sink, State},
    reporter::{Reporter, ReporterHandle},
    telemetry::Telemetry,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 8192;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Errors that could occur while building or installing a DogStatsD recorder/exporter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The maximum payload length is too small to hold any metric.
    #[error("maximum payload length must be at least {minimum} bytes, got {length}")]
    InvalidPayloadLength {
        /// The configured length.
        length: usize,

        /// The smallest usable length.
        minimum: usize,
    },

    /// The delivery pipeline or the aggregator rejected the configuration, or could not be started.
    #[error(transparent)]
    Pipeline(#[from] metrics_pipeline::BuildError),

    /// Failed to spawn the reporter thread.
    #[error("failed to spawn background thread for exporter")]
    Backend(#[source] std::io::Error),

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install exporter as global recorder")]
    FailedToInstall,
}

/// Aggregation mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AggregationMode {
    /// Every update is sent as its own line, as soon as the payload it lands in is flushed.
    ///
    /// Nothing is held in memory besides the payload being built, but every update costs a line on the wire.
    Streaming,

    /// Updates are aggregated in memory and reported once per flush interval.
    ///
    /// Counters are sent as the change since the previous report, and gauges as their latest value. Histograms are sent
    /// as gauges describing their count, sum, average and buckets. Series that see no updates for the expire timeout
    /// are forgotten.
    Aggregated,
}

/// Builder for a DogStatsD exporter.
pub struct DogStatsDBuilder {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    max_payload_len: usize,
    flush_interval: Duration,
    flush_timeout: Duration,
    queue_size: usize,
    retry_after: (Duration, Duration),
    sample_rate: f64,
    prefix: Option<String>,
    global_tags: Vec<Tag>,
    agg_mode: AggregationMode,
    expire_timeout: Option<Duration>,
    histogram_buckets: Option<Vec<f64>>,
    histogram_bucket_overrides: Vec<(Matcher, Vec<f64>)>,
    telemetry: bool,
    histograms_as_distributions: bool,
    timestamps: bool,
    fail: Option<FailCallback>,
}

impl DogStatsDBuilder {
    /// Set the remote address to forward metrics to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`. TCP uses `tcp://<host>:<port>`. For
    /// Unix domain sockets, an address in the format of `<scheme>://<path>`. The scheme can be either `unix` or
    /// `unixgram`, for a stream (`SOCK_STREAM`) or datagram (`SOCK_DGRAM`) socket, respectively.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr =
            RemoteAddr::try_from(addr.as_ref()).map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the write timeout for forwarding metrics.
    ///
    /// When the write timeout is reached, the write operation will be aborted and the payload being sent at the time
    /// will be dropped without retrying. The same timeout bounds connecting to stream transports.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload length for forwarding metrics.
    ///
    /// This controls the maximum size of a single payload that will be sent to the remote server. Metrics are batched
    /// into payloads up to this size. A single metric larger than this is still sent, on its own.
    ///
    /// This should generally be set to the same value (or lower) as `dogstatsd_buffer_size` in the Datadog Agent.
    /// Setting a higher value is likely to lead to invalid metric payloads that are discarded by the Datadog Agent when
    /// received.
    ///
    /// Defaults to 8192 bytes.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Set the flush interval of the aggregator.
    ///
    /// This controls how often aggregated metrics, and the exporter's own telemetry, are reported. A shorter interval
    /// provides more frequent updates to the remote server, but results in more network traffic and processing
    /// overhead.
    ///
    /// Defaults to 3 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set how long a partially filled payload may wait before it is sent anyway.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    /// Set how many updates may wait to be encoded before new ones are dropped.
    ///
    /// Defaults to 1024.
    #[must_use]
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Set the bounds of the delay between attempts to reconnect to the remote server.
    ///
    /// Defaults to between 1 and 15 seconds.
    #[must_use]
    pub fn with_retry_after(mut self, min: Duration, max: Duration) -> Self {
        self.retry_after = (min, max);
        self
    }

    /// Set the fraction of streamed updates to send.
    ///
    /// Sampled lines carry the rate, so that the Datadog Agent scales counts back up. Aggregated reports are never
    /// sampled.
    ///
    /// Defaults to 1.0.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set a prefix for every metric name, joined to the name with a period.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set tags to add to every metric.
    ///
    /// Defaults to no tags.
    #[must_use]
    pub fn with_global_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.global_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the aggregation mode for the exporter.
    ///
    /// See [`AggregationMode`] for more details.
    ///
    /// Defaults to [`AggregationMode::Aggregated`].
    #[must_use]
    pub fn with_aggregation_mode(mut self, mode: AggregationMode) -> Self {
        self.agg_mode = mode;
        self
    }

    /// Set how long an aggregated series may go without updates before it is forgotten.
    ///
    /// `None` or a zero timeout keeps every series forever. Only applies in aggregated mode.
    ///
    /// Defaults to 10 minutes.
    #[must_use]
    pub fn with_expire_timeout(mut self, expire_timeout: Option<Duration>) -> Self {
        self.expire_timeout = expire_timeout;
        self
    }

    /// Set the bucket bounds for aggregated histograms.
    ///
    /// Without bounds, aggregated histograms report only their count, sum and average. Only applies in aggregated
    /// mode. Bounds must be finite and strictly ascending, which is checked when the exporter is built.
    #[must_use]
    pub fn with_histogram_buckets(mut self, bounds: &[f64]) -> Self {
        self.histogram_buckets = Some(bounds.to_vec());
        self
    }

    /// Set the bucket bounds for aggregated histograms whose name matches `matcher`.
    ///
    /// A full match wins over a prefix match, which wins over a suffix match. Only applies in aggregated mode.
    #[must_use]
    pub fn with_histogram_buckets_for_metric(mut self, matcher: Matcher, bounds: &[f64]) -> Self {
        self.histogram_bucket_overrides.push((matcher, bounds.to_vec()));
        self
    }

    /// Sets whether or not to enable telemetry for the exporter.
    ///
    /// When enabled, additional metrics will be sent to the configured remote server that provide insight into the
    /// operation of the exporter itself, such as the number of active metrics, how many payloads and bytes were sent or
    /// dropped, and so on. Telemetry is reported once per flush interval.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sets whether or not to send histograms as distributions.
    ///
    /// When enabled, streamed histogram values will be sent as distributions to the remote server. This changes the
    /// default behavior of how the metrics will be processed by the Datadog Agent, as histograms have a specific set of
    /// default "aggregates" calculated -- `max`, `median`, `avg`, `count`, etc -- locally in the Datadog Agent, whereas
    /// distributions are aggregated entirely on the Datadog backend, and provide richer support for global
    /// aggregation and specific percentiles.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn send_histograms_as_distributions(mut self, histograms_as_distributions: bool) -> Self {
        self.histograms_as_distributions = histograms_as_distributions;
        self
    }

    /// Sets whether or not each metric carries a timestamp.
    ///
    /// Timestamped metrics bypass aggregation in the Datadog Agent. This should only be used when Origin Detection is
    /// enabled, or when no other instances of the application are sending metrics to the same Datadog Agent instance,
    /// as points may otherwise overwrite each other.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Set a callback invoked whenever metrics are dropped or cannot be delivered.
    ///
    /// The callback runs on whichever thread observed the failure, including the threads recording metrics, so it must
    /// not block.
    ///
    /// Defaults to logging the error.
    #[must_use]
    pub fn with_fail_callback<F>(mut self, fail: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.fail = Some(Arc::new(fail));
        self
    }

    /// Builds the recorder.
    ///
    /// The background threads are spawned to forward metrics to the remote server, but the recorder must be manually
    /// installed by the caller.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or a background thread cannot be spawned, an error will be returned.
    pub fn build(self) -> Result<DogStatsDRecorder, BuildError> {
        if self.max_payload_len < SMALLEST_VALID_PAYLOAD.len() {
            return Err(BuildError::InvalidPayloadLength {
                length: self.max_payload_len,
                minimum: SMALLEST_VALID_PAYLOAD.len(),
            });
        }

        let protocol = DogStatsDProtocol::new()
            .with_prefix(self.prefix)
            .with_global_tags(self.global_tags)
            .with_histograms_as_distributions(self.histograms_as_distributions)
            .with_timestamps(self.timestamps)
            .with_sample_rate(self.sample_rate);

        let mut pipeline_builder = PipelineBuilder::new()
            .with_buffer_size(self.max_payload_len)
            .with_queue_size(self.queue_size)
            .with_flush_timeout(self.flush_timeout)
            .with_write_timeout(self.write_timeout)
            .with_retry_after(self.retry_after.0, self.retry_after.1)
            .with_sample_rate(self.sample_rate);
        if let Some(fail) = self.fail {
            pipeline_builder = pipeline_builder.with_fail_callback(move |error: &Error| fail(error));
        }

        let transport = self.remote_addr.transport_id();
        let dialer = NetDialer::new(self.remote_addr, self.write_timeout);
        let pipeline = pipeline_builder.build(dialer, protocol.clone())?;

        let (sink, aggregator) = match self.agg_mode {
            AggregationMode::Streaming => (Sink::Streaming(pipeline.clone()), None),
            AggregationMode::Aggregated => {
                let mut aggregator_builder = AggregatorBuilder::new().with_expire_timeout(self.expire_timeout);
                if let Some(bounds) = &self.histogram_buckets {
                    aggregator_builder = aggregator_builder.with_buckets(bounds)?;
                }
                for (matcher, bounds) in self.histogram_bucket_overrides {
                    aggregator_builder = aggregator_builder.with_buckets_for_metric(matcher, &bounds)?;
                }

                let aggregator = aggregator_builder.build()?;
                (Sink::Aggregated { aggregator: aggregator.clone() }, Some(aggregator))
            }
        };

        let telemetry = self.telemetry.then(|| Telemetry::new(transport));
        let reporter = if aggregator.is_some() || telemetry.is_some() {
            // A zero interval would make the reporter spin.
            let interval = if self.flush_interval.is_zero() { DEFAULT_FLUSH_INTERVAL } else { self.flush_interval };
            let reporter = Reporter::new(pipeline.clone(), protocol, aggregator, telemetry);
            Some(ReporterHandle::spawn(reporter, interval)?)
        } else {
            None
        };

        Ok(DogStatsDRecorder::new(Arc::new(State::new(sink, pipeline, reporter))))
    }

    /// Builds and installs the recorder.
    ///
    /// The background threads are spawned to forward metrics to the remote server, and the recorder will be installed
    /// as the global recorder. The returned handle flushes and shuts down the exporter.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, a background thread cannot be spawned, or a global recorder is already
    /// installed, an error will be returned.
    pub fn install(self) -> Result<DogStatsDHandle, BuildError> {
        let recorder = self.build()?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)?;
        Ok(handle)
    }
}

impl Default for DogStatsDBuilder {
    fn default() -> Self {
        DogStatsDBuilder {
            remote_addr: RemoteAddr::Udp(vec![SocketAddr::from(([127, 0, 0, 1], 8125))]),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            queue_size: DEFAULT_QUEUE_SIZE,
            retry_after: (DEFAULT_RETRY_AFTER_MIN, DEFAULT_RETRY_AFTER_MAX),
            sample_rate: 1.0,
            prefix: None,
            global_tags: Vec::new(),
            agg_mode: AggregationMode::Aggregated,
            expire_timeout: Some(DEFAULT_EXPIRE_TIMEOUT),
            histogram_buckets: None,
            histogram_bucket_overrides: Vec::new(),
            telemetry: true,
            histograms_as_distributions: true,
            timestamps: false,
            fail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics_pipeline::Matcher;

    use super::{AggregationMode, BuildError, DogStatsDBuilder};

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            DogStatsDBuilder::default().with_remote_address("tcp://"),
            Err(BuildError::InvalidRemoteAddress { .. })
        ));
        assert!(matches!(
            DogStatsDBuilder::default().with_maximum_payload_length(5).build(),
            Err(BuildError::InvalidPayloadLength { length: 5, minimum: 6 })
        ));
        assert!(matches!(
            DogStatsDBuilder::default().with_sample_rate(0.0).build(),
            Err(BuildError::Pipeline(metrics_pipeline::BuildError::InvalidSampleRate { .. }))
        ));
        assert!(matches!(
            DogStatsDBuilder::default().with_histogram_buckets(&[]).build(),
            Err(BuildError::Pipeline(metrics_pipeline::BuildError::InvalidBuckets { .. }))
        ));
        assert!(matches!(
            DogStatsDBuilder::default()
                .with_histogram_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), &[f64::NAN])
                .build(),
            Err(BuildError::Pipeline(metrics_pipeline::BuildError::InvalidBuckets { .. }))
        ));
        assert!(matches!(
            DogStatsDBuilder::default().with_histogram_buckets(&[1.0, f64::INFINITY]).build(),
            Err(BuildError::Pipeline(metrics_pipeline::BuildError::InvalidBuckets { .. }))
        ));
        assert!(matches!(
            DogStatsDBuilder::default().with_histogram_buckets(&[5.0, 1.0]).build(),
            Err(BuildError::Pipeline(metrics_pipeline::BuildError::InvalidBuckets { .. }))
        ));
    }

    #[test]
    fn streaming_mode_ignores_histogram_buckets() {
        let recorder = DogStatsDBuilder::default()
            .with_aggregation_mode(AggregationMode::Streaming)
            .with_telemetry(false)
            .with_histogram_buckets(&[])
            .build()
            .unwrap();
        recorder.handle().shutdown().unwrap();
    }
}
