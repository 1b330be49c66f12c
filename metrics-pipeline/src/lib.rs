//! Aggregation and delivery core shared by metrics backend adapters.
//!
//! Application code records counters, gauges, and histograms from any number of threads. This crate takes care of
//! getting them to a backend without ever blocking the caller: a backend adapter only has to describe its wire format,
//! by implementing [`Protocol`] for streamed updates and [`Serializer`] for aggregated snapshots.
//!
//! # Usage
//!
//! ```no_run
//! use metrics_pipeline::{Client, NetDialer, PipelineBuilder, RemoteAddr};
//! # use metrics_pipeline::{EncodeError, MetricKey, Protocol};
//! # use std::{io::Write as _, time::{Duration, SystemTime}};
//! # struct Statsd;
//! # impl Protocol for Statsd {
//! #     fn write_set(&mut self, s: &mut Vec<u8>, k: &MetricKey, v: f64, _: SystemTime) -> Result<(), EncodeError> {
//! #         writeln!(s, "{}:{}|g", k.name(), v).map_err(|e| EncodeError::new(e.to_string()))
//! #     }
//! #     fn write_add(&mut self, s: &mut Vec<u8>, k: &MetricKey, v: f64, _: SystemTime) -> Result<(), EncodeError> {
//! #         writeln!(s, "{}:{}|c", k.name(), v).map_err(|e| EncodeError::new(e.to_string()))
//! #     }
//! #     fn write_observe(&mut self, s: &mut Vec<u8>, k: &MetricKey, v: f64, _: SystemTime) -> Result<(), EncodeError> {
//! #         writeln!(s, "{}:{}|h", k.name(), v).map_err(|e| EncodeError::new(e.to_string()))
//! #     }
//! # }
//! let addr = RemoteAddr::try_from("127.0.0.1:8125").expect("invalid address");
//! let pipeline = PipelineBuilder::new()
//!     .with_buffer_size(1432)
//!     .with_flush_timeout(Duration::from_millis(500))
//!     .build(NetDialer::new(addr, Duration::from_secs(1)), Statsd)
//!     .expect("failed to build pipeline");
//!
//! // Handles compute their identity once: create them once, use them many times.
//! let client = Client::new(pipeline);
//! let requests = client.counter("requests", [("route", "/home")]);
//! requests.increment();
//!
//! client.close().expect("final flush failed");
//! ```
//!
//! # Architecture
//!
//! ## Delivery
//!
//! Every [`Pipeline`] owns a single background thread, which in turn owns the connection to the backend. Producers hand
//! jobs to it over a bounded queue and never wait: when the queue is full or closed, the job is dropped and reported to
//! the failure callback. The background thread encodes jobs into pooled buffers, batches them up to the configured
//! buffer size, and writes whenever a batch fills up or the flush interval elapses.
//!
//! When a write fails, the connection is dropped and the payload is lost. The next write dials again, backing off
//! exponentially between failed attempts.
//!
//! ## Aggregation
//!
//! An [`Aggregator`] folds updates into an [`AggregationStore`] instead of streaming them. Counters and gauges are
//! updated without locks once their series exists, and idle series are expired in the background. Snapshots of the
//! store are serialized with a [`BatchWriter`] and handed to a pipeline as pre-encoded payloads.
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod aggregator;
pub use self::aggregator::{
    AggregatedCounter, AggregatedGauge, AggregatedHistogram, Aggregator, AggregatorBuilder, Handle,
    DEFAULT_EXPIRE_TIMEOUT,
};

mod atomic;
pub use self::atomic::AtomicValue;

pub mod buffer;
pub use self::buffer::BatchWriter;

mod builder;
pub use self::builder::{
    PipelineBuilder, DEFAULT_BUFFER_SIZE, DEFAULT_FLUSH_TIMEOUT, DEFAULT_QUEUE_SIZE, DEFAULT_RETRY_AFTER_MAX,
    DEFAULT_RETRY_AFTER_MIN, DEFAULT_WRITE_TIMEOUT,
};

mod client;
pub use self::client::{Client, Counter, Gauge, Histogram};

mod connection;
pub use self::connection::ConnectionState;

mod error;
pub use self::error::{BuildError, EncodeError, Error, FailCallback};

pub mod global;

mod key;
pub use self::key::{make_key, MetricKey, MetricKind, Tag};

mod pipeline;
pub use self::pipeline::Pipeline;

mod protocol;
pub use self::protocol::{Protocol, Serializer};

mod queue;
pub use self::queue::{Enqueued, Job, Operation};

mod stats;
pub use self::stats::Stats;

pub mod store;
pub use self::store::{AggregationStore, HistogramBuckets, HistogramSnapshot, Matcher, MetricState, Sample};

pub mod transport;
pub use self::transport::{Connection, Dialer, NetConnection, NetDialer, RemoteAddr};

#[cfg(test)]
mod test_util;
