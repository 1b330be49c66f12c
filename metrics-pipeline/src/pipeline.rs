use std::{fmt, sync::Arc, thread::JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    buffer::{BatchWriter, ChunkPool, PooledBuffer},
    connection::{ConnectionState, Control},
    error::{EncodeError, Error, FailCallback},
    key::MetricKey,
    protocol::Serializer,
    queue::{DeliveryQueue, Enqueued, Job, Operation},
    stats::{Shared, Stats},
    store::Sample,
};

pub(crate) struct Inner {
    pub queue: DeliveryQueue,
    pub control: Sender<Control>,
    pub shutdown: Mutex<Option<Sender<()>>>,
    pub handle: Mutex<Option<JoinHandle<Option<Error>>>>,
    pub shared: Arc<Shared>,
    pub pool: ChunkPool,
    pub buffer_size: usize,
    pub fail: FailCallback,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Signal the consumer to drain and stop, but don't wait for it.
        self.queue.close();
        self.shutdown.get_mut().take();
    }
}

/// Handle to a running delivery pipeline.
///
/// A pipeline owns one background thread, which owns the connection to the backend. Handles are cheap to clone and
/// every clone feeds the same thread. Recording calls never block: if the pipeline cannot keep up, updates are dropped
/// and reported through the failure callback.
///
/// Pipelines are created with [`PipelineBuilder`][crate::PipelineBuilder].
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Hands a job to the pipeline.
    ///
    /// Sampling is applied here. If the job survives sampling but the queue is full or closed, it is dropped and the
    /// failure callback is invoked before this returns.
    pub fn enqueue(&self, job: Job) -> Enqueued {
        self.inner.queue.enqueue(job)
    }

    /// Builds a job for `key` timestamped now, and hands it to the pipeline.
    pub fn send(&self, key: &MetricKey, operation: Operation, value: f64) -> Enqueued {
        self.enqueue(Job::new(key.clone(), operation, value))
    }

    /// Hands an already-encoded payload to the pipeline.
    ///
    /// Payloads bypass sampling and encoding, and are batched with everything else.
    pub fn send_payload(&self, payload: PooledBuffer) -> Enqueued {
        self.inner.queue.send_payload(payload)
    }

    /// Returns a writer for serializing snapshots into payloads sized for this pipeline.
    pub fn batch_writer(&self) -> BatchWriter {
        BatchWriter::new(self.inner.pool.clone(), self.inner.buffer_size)
    }

    /// Serializes `samples` through `batches` and hands every filled buffer to the pipeline.
    ///
    /// Samples that fail to serialize are skipped and reported through the failure callback. Returns the number of
    /// samples serialized.
    pub fn export<S>(&self, samples: &[Sample], serializer: &S, batches: &BatchWriter) -> usize
    where
        S: Serializer + ?Sized,
    {
        let mut exported = 0;
        for sample in samples {
            match batches.write_batch(|sink| serializer.serialize(sink, sample)) {
                Ok(detached) => {
                    exported += 1;
                    for payload in detached {
                        self.send_payload(payload);
                    }
                }
                Err(source) => self.report_encode(&sample.key, source),
            }
        }

        if let Some(rest) = batches.finish() {
            self.send_payload(rest);
        }
        exported
    }

    fn report_encode(&self, key: &MetricKey, source: EncodeError) {
        let error = Error::Encode { key: key.encoded().to_string(), source };
        debug!(%error, "Failed to serialize sample.");
        self.report(&error);
    }

    pub(crate) fn report(&self, error: &Error) {
        (self.inner.fail)(error);
    }

    /// Writes everything enqueued so far, waiting for the result.
    ///
    /// # Errors
    ///
    /// If the pipeline is closed, or the backend could not be reached or written to, an error is returned. A write
    /// failure since the previous flush is also returned here, even if this flush itself succeeded.
    pub fn flush(&self) -> Result<(), Error> {
        if self.inner.queue.is_closed() {
            return Err(Error::Closed);
        }

        let (tx, rx) = bounded(1);
        self.inner.control.send(Control::Flush(tx)).map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Closes the pipeline, writing everything enqueued so far and waiting for the background thread to stop.
    ///
    /// Jobs enqueued after this is called are dropped. Closing more than once is harmless: later calls return
    /// immediately.
    ///
    /// # Errors
    ///
    /// If the last write before shutdown failed, that error is returned. If the backend could not be reached for the
    /// closing flush, [`Error::Abandoned`] is returned with the number of bytes discarded.
    pub fn close(&self) -> Result<(), Error> {
        self.inner.queue.close();
        self.inner.shutdown.lock().take();

        let Some(handle) = self.inner.handle.lock().take() else {
            return Ok(());
        };

        match handle.join() {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(error),
            Err(_) => Err(Error::Panicked {
                context: "running the connection manager",
                message: "consumer thread panicked".to_string(),
            }),
        }
    }

    /// Returns `true` once the pipeline has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    /// Returns counters describing the pipeline's activity so far.
    pub fn stats(&self) -> Stats {
        self.inner.shared.snapshot()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use crate::{
        aggregator::AggregatorBuilder,
        builder::PipelineBuilder,
        connection::ConnectionState,
        error::{BuildError, EncodeError, Error},
        key::{MetricKey, MetricKind, Tag},
        protocol::Serializer,
        queue::{Enqueued, Job, Operation},
        store::{MetricState, Sample},
        test_util::{recording_callback, wait_for, LineProtocol, MemoryDialer},
    };

    const HOUR: Duration = Duration::from_secs(3600);

    fn job(name: &str, operation: Operation, value: f64) -> Job {
        Job {
            key: MetricKey::new(MetricKind::Gauge, name, Vec::<Tag>::new()),
            value,
            timestamp: UNIX_EPOCH + Duration::from_secs(1),
            operation,
        }
    }

    fn lines(payload: &[u8]) -> String {
        String::from_utf8(payload.to_vec()).expect("payload should be utf-8")
    }

    #[test]
    fn buffers_until_the_next_job_would_overflow() {
        let dialer = MemoryDialer::new();
        let pipeline = PipelineBuilder::new()
            .with_buffer_size(20)
            .with_flush_timeout(HOUR)
            .with_write_timeout(Duration::from_millis(250))
            .build(dialer.clone(), LineProtocol)
            .unwrap();
        assert_eq!(pipeline.state(), ConnectionState::Idle);

        assert_eq!(pipeline.enqueue(job("test", Operation::Set, 1.0)), Enqueued::Queued);
        assert_eq!(pipeline.enqueue(job("test", Operation::Set, 10.0)), Enqueued::Queued);

        wait_for("first payload", || dialer.writes().len() == 1);
        assert_eq!(lines(&dialer.writes()[0]), "set:test:1/1\n");
        assert_eq!(pipeline.state(), ConnectionState::Connected);

        pipeline.flush().unwrap();
        let writes = dialer.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(lines(&writes[1]), "set:test:10/1\n");
        assert!(writes.iter().all(|w| w.len() <= 20));
        assert!(dialer.write_timeouts().iter().all(|t| *t == Duration::from_millis(250)));

        let stats = pipeline.stats();
        assert_eq!(stats.jobs_enqueued, 2);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.bytes_written, 27);
        assert_eq!(stats.connects, 1);
        pipeline.close().unwrap();
    }

    #[test]
    fn flush_timer_writes_partial_buffers() {
        let dialer = MemoryDialer::new();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(Duration::from_millis(10))
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        pipeline.enqueue(job("tick", Operation::Add, 2.0));
        wait_for("timer flush", || !dialer.writes().is_empty());
        assert_eq!(dialer.written_lines(), vec!["add:tick:2/1"]);
        pipeline.close().unwrap();
    }

    #[test]
    fn reconnects_with_backoff() {
        let dialer = MemoryDialer::new();
        dialer.fail_next_dials(3);
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_buffer_size(1)
            .with_retry_after(Duration::from_millis(1), Duration::from_millis(4))
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        pipeline.enqueue(job("up", Operation::Set, 1.0));
        wait_for("delivery after reconnecting", || dialer.writes().len() == 1);

        assert_eq!(dialer.dials(), 4);
        assert_eq!(errors.lock().iter().filter(|e| matches!(e, Error::Dial { transport: "memory", .. })).count(), 3);
        let stats = pipeline.stats();
        assert_eq!(stats.dial_errors, 3);
        assert_eq!(stats.connects, 1);
        pipeline.close().unwrap();
    }

    #[test]
    fn write_failure_drops_connection_and_payload() {
        let dialer = MemoryDialer::new();
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_buffer_size(1)
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        // Connect first, so that the failing write happens on a live connection.
        pipeline.enqueue(job("a", Operation::Set, 1.0));
        wait_for("first write", || dialer.writes().len() == 1);

        dialer.fail_next_writes(1);
        pipeline.enqueue(job("b", Operation::Set, 2.0));
        pipeline.enqueue(job("c", Operation::Set, 3.0));
        wait_for("write after reconnecting", || dialer.writes().len() == 2);

        assert_eq!(dialer.written_lines(), vec!["set:a:1/1", "set:c:3/1"]);
        assert_eq!(dialer.dials(), 2);
        assert!(errors.lock().iter().any(|e| matches!(e, Error::Write { bytes: 10, .. })));

        // The failed write surfaces once through the next administrative call.
        assert!(matches!(pipeline.flush(), Err(Error::Write { .. })));
        assert!(pipeline.flush().is_ok());

        let stats = pipeline.stats();
        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.bytes_lost, 10);
        pipeline.close().unwrap();
    }

    #[test]
    fn encode_failures_and_panics_are_contained() {
        let dialer = MemoryDialer::new();
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new().with_fail_callback(fail).build(dialer.clone(), LineProtocol).unwrap();

        pipeline.enqueue(job("invalid", Operation::Set, 1.0));
        pipeline.enqueue(job("panic", Operation::Set, 1.0));
        pipeline.enqueue(job("fine", Operation::Observe, 0.5));
        pipeline.flush().unwrap();

        assert_eq!(dialer.written_lines(), vec!["observe:fine:0.5/1"]);
        let errors = errors.lock();
        assert!(errors.iter().any(|e| matches!(e, Error::Encode { key, .. } if key == "invalid?")));
        assert!(errors.iter().any(|e| matches!(e, Error::Panicked { message, .. } if message == "protocol exploded")));
        drop(errors);
        pipeline.close().unwrap();
    }

    #[test]
    fn close_drains_queue_in_order() {
        let dialer = MemoryDialer::new();
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(HOUR)
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        for i in 0..3 {
            pipeline.enqueue(job("ordered", Operation::Add, f64::from(i)));
        }
        pipeline.close().unwrap();

        assert_eq!(dialer.written_lines(), vec!["add:ordered:0/1", "add:ordered:1/1", "add:ordered:2/1"]);
        assert_eq!(pipeline.state(), ConnectionState::Closed);
        assert!(pipeline.is_closed());

        // Closing twice is harmless, and nothing is accepted afterwards.
        pipeline.close().unwrap();
        assert_eq!(pipeline.enqueue(job("late", Operation::Set, 1.0)), Enqueued::Dropped);
        assert!(matches!(errors.lock().last(), Some(Error::QueueClosed)));
        assert!(matches!(pipeline.flush(), Err(Error::Closed)));
    }

    #[test]
    fn close_while_disconnected_abandons_promptly() {
        let dialer = MemoryDialer::new();
        dialer.fail_next_dials(usize::MAX);
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(HOUR)
            .with_retry_after(Duration::from_secs(10), Duration::from_secs(15))
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        pipeline.enqueue(job("test", Operation::Set, 1.0));

        let started = Instant::now();
        assert!(matches!(pipeline.close(), Err(Error::Abandoned { bytes: 13 })));
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(dialer.writes().is_empty());
        assert!(errors.lock().iter().any(|e| matches!(e, Error::Abandoned { bytes: 13 })));
        assert_eq!(pipeline.stats().bytes_lost, 13);
    }

    #[test]
    fn close_reports_failed_final_write() {
        let dialer = MemoryDialer::new();
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(HOUR)
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        pipeline.enqueue(job("test", Operation::Set, 1.0));
        pipeline.enqueue(job("test", Operation::Set, 10.0));
        dialer.fail_next_writes(1);

        assert!(matches!(pipeline.close(), Err(Error::Write { bytes: 27, .. })));
        assert!(dialer.writes().is_empty());
        assert_eq!(errors.lock().iter().filter(|e| matches!(e, Error::Write { .. })).count(), 1);
        assert_eq!(pipeline.stats().bytes_lost, 27);

        // Only the first close reports it.
        pipeline.close().unwrap();
    }

    #[test]
    fn explicit_flush_reports_dial_failure() {
        let dialer = MemoryDialer::new();
        dialer.fail_next_dials(1);
        let (fail, _errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_flush_timeout(HOUR)
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();

        pipeline.enqueue(job("test", Operation::Set, 1.0));
        assert!(matches!(pipeline.flush(), Err(Error::Dial { .. })));
        assert_eq!(pipeline.state(), ConnectionState::Disconnected);

        // The buffered bytes survive the failed flush.
        pipeline.flush().unwrap();
        assert_eq!(dialer.written_lines(), vec!["set:test:1/1"]);
        pipeline.close().unwrap();
    }

    struct KeyValue;

    impl Serializer for KeyValue {
        fn serialize(&self, sink: &mut Vec<u8>, sample: &Sample) -> Result<(), EncodeError> {
            let value = match &sample.state {
                MetricState::Counter(v) | MetricState::Gauge(v) => *v,
                MetricState::Histogram(h) => h.sum(),
            };
            if value < 0.0 {
                return Err(EncodeError::new("negative"));
            }
            sink.extend_from_slice(format!("{}={}\n", sample.key.encoded(), value).as_bytes());
            Ok(())
        }
    }

    #[test]
    fn exports_snapshots_as_payloads() {
        let dialer = MemoryDialer::new();
        let (fail, errors) = recording_callback();
        let pipeline = PipelineBuilder::new()
            .with_buffer_size(32)
            .with_flush_timeout(HOUR)
            .with_fail_callback(fail)
            .build(dialer.clone(), LineProtocol)
            .unwrap();
        let aggregator = AggregatorBuilder::new().with_expire_timeout(None).build().unwrap();

        aggregator.counter("hits", [("route", "a")]).add(3.0);
        aggregator.counter("hits", [("route", "b")]).add(4.0);
        aggregator.gauge("temp", [("room", "x")]).set(-1.0);

        let batches = pipeline.batch_writer();
        assert_eq!(aggregator.export(&pipeline, &KeyValue, &batches), 2);
        pipeline.flush().unwrap();

        let mut exported = dialer.written_lines();
        exported.sort();
        assert_eq!(exported, vec!["hits?route=a=3", "hits?route=b=4"]);
        assert!(dialer.writes().iter().all(|w| w.len() <= 32));
        assert!(errors.lock().iter().any(|e| matches!(e, Error::Encode { key, .. } if key == "temp?room=x")));
        // Both samples fit in one batch.
        assert_eq!(pipeline.stats().payloads_enqueued, 1);
        pipeline.close().unwrap();
    }

    #[test]
    fn builder_rejects_invalid_configuration() {
        let build = |builder: PipelineBuilder| builder.build(MemoryDialer::new(), LineProtocol).map(|_| ());

        assert!(matches!(build(PipelineBuilder::new().with_buffer_size(0)), Err(BuildError::InvalidBufferSize)));
        assert!(matches!(
            build(PipelineBuilder::new().with_retry_after(Duration::from_secs(2), Duration::from_secs(1))),
            Err(BuildError::InvalidRetryBounds { .. })
        ));
        assert!(matches!(
            build(PipelineBuilder::new().with_retry_after(Duration::ZERO, Duration::from_secs(1))),
            Err(BuildError::InvalidRetryBounds { .. })
        ));
        assert!(matches!(
            build(PipelineBuilder::new().with_sample_rate(0.0)),
            Err(BuildError::InvalidSampleRate { .. })
        ));
        assert!(matches!(
            build(PipelineBuilder::new().with_sample_rate(f64::NAN)),
            Err(BuildError::InvalidSampleRate { .. })
        ));
    }

    #[test]
    fn timestamps_default_to_now() {
        let before = SystemTime::now();
        let job = Job::new(MetricKey::new(MetricKind::Counter, "x", Vec::<Tag>::new()), Operation::Add, 1.0);
        assert!(job.timestamp >= before);
    }
}
