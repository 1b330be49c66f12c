//! A [`metrics`]-compatible exporter for sending metrics to a [DogStatsD][dsd]-compatible server.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! Using the exporter is straightforward:
//!
//! ```no_run
//! # use metrics_exporter_dogstatsd::DogStatsDBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the exporter, such as changing the remote address, choosing between
//! // streaming and aggregating metrics, configuring histogram buckets, and more.
//! let builder = DogStatsDBuilder::default();
//!
//! // Normally, most users will want to "install" the exporter which sets it as the global recorder for all `metrics`
//! // calls, and spawns the background threads that deliver the metrics to the remote DogStatsD server. The returned
//! // handle flushes and shuts down the exporter.
//! let handle = builder.install().expect("failed to install recorder/exporter");
//!
//! metrics::counter!("requests", "route" => "/home").increment(1);
//!
//! handle.shutdown().expect("failed to send final metrics");
//!
//! // For scenarios where you need access to the `Recorder` object, perhaps to wrap it in a layer stack, or something
//! // else, you can simply call `build` instead of `install`:
//! # let builder = DogStatsDBuilder::default();
//! let recorder = builder.build().expect("failed to build recorder");
//! ```
//!
//! # Features
//!
//! ## Client-side aggregation
//!
//! By default, counters, gauges and histograms are aggregated in memory and reported once per flush interval: counters
//! as the change since the previous report, gauges as their latest value, and histograms as their count, sum, average
//! and cumulative buckets. This helps reduce load on the downstream DogStatsD server. Series that stop being updated
//! are forgotten after the expire timeout.
//!
//! ## Streaming
//!
//! Alternatively, every update can be streamed as its own line, optionally sampled. Streamed updates are still batched
//! into payloads up to the maximum payload length before being written.
//!
//! ## Non-blocking delivery
//!
//! Recording a metric never waits on the network. Delivery happens on a background thread that owns the connection,
//! reconnects with exponential backoff after failures, and reports anything it has to drop through the failure
//! callback.
//!
//! ## Full transport support
//!
//! The exporter supports sending metrics to a DogStatsD server over UDP, TCP, and Unix domain sockets in either
//! `SOCK_DGRAM` or `SOCK_STREAM` mode.
//!
//! `SOCK_STREAM` mode is roughly equivalent to TCP, but only available on the same host, and provides better
//! guarantees around message delivery in high-throughput scenarios.
//!
//! ## Telemetry
//!
//! The exporter captures its own internal telemetry around the number of active metrics, payloads/bytes sent or
//! dropped, and so on. This telemetry is emitted to the same downstream DogStatsD server as the exporter itself.
//!
//! All internal telemetry is under the `datadog.dogstatsd.client` namespace, to align with the internal telemetry
//! emitted by official DogStatsD clients.
//!
//! # Missing
//!
//! ## Container ID detection
//!
//! We do not yet support container ID detection (DSD v1.2) which is used to help aid the downstream DogStatsD server in
//! enriching the metrics with additional metadata relevant to the host/application emitting the metrics.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{AggregationMode, BuildError, DogStatsDBuilder};

mod protocol;
pub use self::protocol::DogStatsDProtocol;

mod recorder;
pub use self::recorder::{DogStatsDHandle, DogStatsDRecorder};

mod reporter;
mod storage;
mod telemetry;

pub use metrics_pipeline::{ConnectionState, Error, Matcher, Stats};

#[cfg(test)]
mod test_util;
