use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use metrics_pipeline::{EncodeError, MetricKey, MetricState, Protocol, Sample, Serializer, Tag};

pub(crate) const SMALLEST_VALID_PAYLOAD: &[u8] = b"a:0|c\n";

// Integral values below this magnitude are exactly representable, and are written without a fractional part.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Distribution,
}

impl MetricType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Counter => b"|c",
            MetricType::Gauge => b"|g",
            MetricType::Histogram => b"|h",
            MetricType::Distribution => b"|d",
        }
    }
}

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    #[allow(clippy::float_cmp)]
    fn format(&mut self, value: f64) -> &str {
        if value.trunc() == value && value.abs() < MAX_EXACT_INTEGER {
            self.int_writer.format(value as i64)
        } else {
            self.float_writer.format(value)
        }
    }
}

/// The DogStatsD wire format.
///
/// Every metric is written as a single newline-terminated line:
///
/// ```text
/// [prefix.]name:value|type[|#tag1:value1,tag2][|Ttimestamp]
/// ```
///
/// Streamed updates map onto DogStatsD types by operation: `Add` becomes a count (`|c`), `Set` becomes a gauge (`|g`),
/// and `Observe` becomes a distribution (`|d`) or a histogram (`|h`). Tags with an empty value are written bare, as just
/// the tag key. Global tags follow the tags of each metric.
///
/// The same type also serializes aggregated snapshots, see the [`Serializer`] implementation.
#[derive(Clone, Debug)]
pub struct DogStatsDProtocol {
    prefix: Option<Arc<str>>,
    global_tags: Arc<[Tag]>,
    histograms_as_distributions: bool,
    timestamps: bool,
    sample_rate: Option<f64>,
}

impl DogStatsDProtocol {
    /// Creates a new `DogStatsDProtocol` with no prefix or global tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a prefix for every metric name.
    ///
    /// The prefix is joined to the name with a period: a prefix of `app` turns `requests` into `app.requests`.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: Option<P>) -> Self
    where
        P: Into<String>,
    {
        self.prefix = prefix.map(Into::into).filter(|p| !p.is_empty()).map(Arc::from);
        self
    }

    /// Sets tags to append to every metric.
    #[must_use]
    pub fn with_global_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        self.global_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether observations are sent as distributions (`|d`) rather than histograms (`|h`).
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_histograms_as_distributions(mut self, histograms_as_distributions: bool) -> Self {
        self.histograms_as_distributions = histograms_as_distributions;
        self
    }

    /// Sets whether each line carries the timestamp of the update, as a `|T` field in Unix seconds.
    ///
    /// Timestamped metrics bypass aggregation in the Datadog Agent. Only enable this when no other process sends the
    /// same metrics to the same agent, or points may overwrite each other.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Sets the rate at which streamed updates are sampled, written as a `|@rate` field so that the Datadog Agent can
    /// scale counts back up.
    ///
    /// Only rates below 1.0 are written. Aggregated snapshots are never sampled, and never carry the field.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = (sample_rate < 1.0).then_some(sample_rate);
        self
    }

    fn observation_type(&self) -> MetricType {
        if self.histograms_as_distributions {
            MetricType::Distribution
        } else {
            MetricType::Histogram
        }
    }

    fn timestamp(&self, ts: SystemTime) -> Option<u64> {
        if !self.timestamps {
            return None;
        }
        ts.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
    }

    fn write_metric(
        &self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        metric_type: MetricType,
        ts: SystemTime,
    ) -> Result<(), EncodeError> {
        let line = Line {
            prefix: self.prefix.as_deref(),
            name: key.name(),
            suffix: None,
            value,
            metric_type,
            sample_rate: self.sample_rate,
            tags: key.tags(),
            extra_tag: None,
            global_tags: &self.global_tags,
            timestamp: self.timestamp(ts),
        };
        line.write(sink)
    }

    /// Writes one of the exporter's own metrics: a count, without the prefix or a timestamp.
    pub(crate) fn write_telemetry(
        &self,
        sink: &mut Vec<u8>,
        name: &str,
        value: f64,
        tags: &[Tag],
    ) -> Result<(), EncodeError> {
        let line = Line {
            prefix: None,
            name,
            suffix: None,
            value,
            metric_type: MetricType::Counter,
            sample_rate: None,
            tags,
            extra_tag: None,
            global_tags: &self.global_tags,
            timestamp: None,
        };
        line.write(sink)
    }
}

impl Default for DogStatsDProtocol {
    fn default() -> Self {
        Self {
            prefix: None,
            global_tags: Arc::from(Vec::new()),
            histograms_as_distributions: true,
            timestamps: false,
            sample_rate: None,
        }
    }
}

impl Protocol for DogStatsDProtocol {
    fn write_set(&mut self, sink: &mut Vec<u8>, key: &MetricKey, value: f64, ts: SystemTime) -> Result<(), EncodeError> {
        self.write_metric(sink, key, value, MetricType::Gauge, ts)
    }

    fn write_add(&mut self, sink: &mut Vec<u8>, key: &MetricKey, value: f64, ts: SystemTime) -> Result<(), EncodeError> {
        self.write_metric(sink, key, value, MetricType::Counter, ts)
    }

    fn write_observe(
        &mut self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        ts: SystemTime,
    ) -> Result<(), EncodeError> {
        let metric_type = self.observation_type();
        self.write_metric(sink, key, value, metric_type, ts)
    }
}

/// Serializes aggregated samples.
///
/// Counters are written as counts and gauges as gauges. The caller decides what a counter sample holds: the exporter's
/// reporter hands over the change since the previous report, never the running total.
///
/// A histogram is written as a set of gauges describing its state so far: `<name>.count`, `<name>.sum`, `<name>.avg`
/// (when at least one value was observed), and one `<name>.bucket` gauge per bound, tagged with `le:<bound>` and
/// holding the cumulative count of values at or below that bound. A final `le:+Inf` bucket holds the total count.
impl Serializer for DogStatsDProtocol {
    fn serialize(&self, sink: &mut Vec<u8>, sample: &Sample) -> Result<(), EncodeError> {
        let timestamp = self.timestamp(SystemTime::now());
        let mut line = Line {
            prefix: self.prefix.as_deref(),
            name: sample.key.name(),
            suffix: None,
            value: 0.0,
            metric_type: MetricType::Gauge,
            sample_rate: None,
            tags: sample.key.tags(),
            extra_tag: None,
            global_tags: &self.global_tags,
            timestamp,
        };

        match &sample.state {
            MetricState::Counter(value) => {
                line.value = *value;
                line.metric_type = MetricType::Counter;
                line.write(sink)
            }
            MetricState::Gauge(value) => {
                line.value = *value;
                line.write(sink)
            }
            MetricState::Histogram(histogram) => {
                line.suffix = Some("count");
                line.value = histogram.count() as f64;
                line.write(sink)?;

                line.suffix = Some("sum");
                line.value = histogram.sum();
                line.write(sink)?;

                if let Some(mean) = histogram.mean() {
                    line.suffix = Some("avg");
                    line.value = mean;
                    line.write(sink)?;
                }

                line.suffix = Some("bucket");
                let mut formatter = MetricValueFormatter::new();
                let mut cumulative = 0;
                for (bound, count) in histogram.buckets() {
                    cumulative += count;
                    let le = Tag::new("le", formatter.format(bound).to_string());
                    Line { value: cumulative as f64, extra_tag: Some(&le), ..line }.write(sink)?;
                }

                if !histogram.bounds().is_empty() {
                    let le = Tag::from_static("le", "+Inf");
                    Line { value: histogram.count() as f64, extra_tag: Some(&le), ..line }.write(sink)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Clone, Copy)]
struct Line<'a> {
    prefix: Option<&'a str>,
    name: &'a str,
    suffix: Option<&'a str>,
    value: f64,
    metric_type: MetricType,
    sample_rate: Option<f64>,
    tags: &'a [Tag],
    extra_tag: Option<&'a Tag>,
    global_tags: &'a [Tag],
    timestamp: Option<u64>,
}

impl Line<'_> {
    fn write(&self, sink: &mut Vec<u8>) -> Result<(), EncodeError> {
        self.validate()?;

        if let Some(prefix) = self.prefix {
            sink.extend_from_slice(prefix.as_bytes());
            sink.push(b'.');
        }
        sink.extend_from_slice(self.name.as_bytes());
        if let Some(suffix) = self.suffix {
            sink.push(b'.');
            sink.extend_from_slice(suffix.as_bytes());
        }

        let mut formatter = MetricValueFormatter::new();
        sink.push(b':');
        sink.extend_from_slice(formatter.format(self.value).as_bytes());
        sink.extend_from_slice(self.metric_type.as_bytes());

        if let Some(sample_rate) = self.sample_rate {
            let mut float_writer = ryu::Buffer::new();
            sink.extend_from_slice(b"|@");
            sink.extend_from_slice(float_writer.format(sample_rate).as_bytes());
        }

        let mut wrote_tag = false;
        for tag in self.tags().chain(self.global_tags.iter()) {
            if wrote_tag {
                sink.push(b',');
            } else {
                sink.extend_from_slice(b"|#");
                wrote_tag = true;
            }
            write_tag(sink, tag);
        }

        if let Some(timestamp) = self.timestamp {
            let mut int_writer = itoa::Buffer::new();
            sink.extend_from_slice(b"|T");
            sink.extend_from_slice(int_writer.format(timestamp).as_bytes());
        }

        sink.push(b'\n');
        Ok(())
    }

    fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().chain(self.extra_tag)
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if self.name.is_empty() {
            return Err(EncodeError::new("metric name is empty"));
        }
        if self.name.contains(is_reserved_in_name) {
            return Err(EncodeError::new(format!("metric name `{}` contains a reserved character", self.name)));
        }
        if !self.value.is_finite() {
            return Err(EncodeError::new(format!("value {} is not finite", self.value)));
        }
        for tag in self.tags().chain(self.global_tags.iter()) {
            if tag.key().is_empty() {
                return Err(EncodeError::new("tag key is empty"));
            }
            if tag.key().contains(is_reserved_in_tag) || tag.value().contains(is_reserved_in_tag) {
                return Err(EncodeError::new(format!("tag `{}` contains a reserved character", tag.key())));
            }
        }
        Ok(())
    }
}

fn is_reserved_in_name(c: char) -> bool {
    matches!(c, ':' | '|' | '@' | '#' | '\n')
}

fn is_reserved_in_tag(c: char) -> bool {
    matches!(c, '|' | ',' | '\n')
}

fn write_tag(buf: &mut Vec<u8>, tag: &Tag) {
    // An empty value makes a bare tag: `tag` rather than `tag:`.
    buf.extend_from_slice(tag.key().as_bytes());
    if tag.value().is_empty() {
        return;
    }

    buf.push(b':');
    buf.extend_from_slice(tag.value().as_bytes());
}
