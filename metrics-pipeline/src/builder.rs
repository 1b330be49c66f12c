use std::{sync::Arc, time::Duration};

use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;

use crate::{
    buffer::ChunkPool,
    connection::{Channels, ConnectionManager, ManagerConfig},
    error::{default_fail_callback, BuildError, Error, FailCallback},
    pipeline::{Inner, Pipeline},
    protocol::Protocol,
    queue::DeliveryQueue,
    stats::Shared,
    transport::Dialer,
};

/// Default size, in bytes, at which buffered metrics are written. Fits in a single Ethernet frame.
pub const DEFAULT_BUFFER_SIZE: usize = 1432;
/// Default number of jobs the delivery queue holds before dropping.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
/// Default initial delay between reconnect attempts.
pub const DEFAULT_RETRY_AFTER_MIN: Duration = Duration::from_secs(1);
/// Default ceiling on the delay between reconnect attempts.
pub const DEFAULT_RETRY_AFTER_MAX: Duration = Duration::from_secs(15);
/// Default interval at which partially filled buffers are written.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// Default timeout applied to each write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_POOL_SIZE: usize = 64;

const CONSUMER_THREAD_NAME: &str = "metrics-pipeline-connection";

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    buffer_size: usize,
    queue_size: usize,
    retry_after_min: Duration,
    retry_after_max: Duration,
    flush_timeout: Duration,
    write_timeout: Duration,
    sample_rate: f64,
    pool_size: usize,
    fail: Option<FailCallback>,
}

impl PipelineBuilder {
    /// Creates a new `PipelineBuilder` with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size at which buffered metrics are written.
    ///
    /// Encoded metrics accumulate until adding the next one would exceed this size. A single metric larger than this is
    /// written on its own. For datagram transports, this should not exceed what the network path can carry in one
    /// packet.
    ///
    /// Defaults to 1432 bytes.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets how many jobs the delivery queue holds.
    ///
    /// When the queue is full, new jobs are dropped rather than blocking the caller. A size of zero hands jobs off
    /// only when the background thread is ready to take them.
    ///
    /// Defaults to 1024.
    #[must_use]
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the bounds of the delay between reconnect attempts.
    ///
    /// The delay doubles after every failed attempt, up to `max`, and resets after a successful one.
    ///
    /// Defaults to 1 second and 15 seconds.
    #[must_use]
    pub fn with_retry_after(mut self, min: Duration, max: Duration) -> Self {
        self.retry_after_min = min;
        self.retry_after_max = max;
        self
    }

    /// Sets the interval at which partially filled buffers are written.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    /// Sets the timeout applied to each write.
    ///
    /// When the write timeout is reached, the payload being written is dropped and the connection is re-established.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Sets the fraction of jobs that are kept.
    ///
    /// Sampling is applied as jobs are enqueued. Payloads handed over with
    /// [`Pipeline::send_payload`][crate::Pipeline::send_payload] are never sampled.
    ///
    /// Defaults to 1.0, which keeps everything.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Sets how many free buffers are kept for reuse.
    ///
    /// Defaults to 64.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the callback invoked with every asynchronous failure, such as dropped jobs and failed writes.
    ///
    /// The callback runs on whichever thread hit the failure, including producer threads when a job is dropped, so it
    /// must be cheap and must not block.
    ///
    /// Defaults to logging the failure at the warning level.
    #[must_use]
    pub fn with_fail_callback<F>(mut self, fail: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.fail = Some(Arc::new(fail));
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.buffer_size == 0 {
            return Err(BuildError::InvalidBufferSize);
        }
        if self.retry_after_min.is_zero() || self.retry_after_min > self.retry_after_max {
            return Err(BuildError::InvalidRetryBounds { min: self.retry_after_min, max: self.retry_after_max });
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(BuildError::InvalidSampleRate { rate: self.sample_rate });
        }
        Ok(())
    }

    /// Builds the pipeline and spawns its background thread.
    ///
    /// The connection is not dialed until there is something to write.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the background thread cannot be spawned, an error is returned.
    pub fn build<D, P>(self, dialer: D, protocol: P) -> Result<Pipeline, BuildError>
    where
        D: Dialer,
        P: Protocol,
    {
        self.validate()?;

        let fail = self.fail.unwrap_or_else(default_fail_callback);
        let shared = Arc::new(Shared::default());
        let pool = ChunkPool::new(self.pool_size, self.buffer_size);

        let (queue, jobs) = DeliveryQueue::new(self.queue_size, self.sample_rate, Arc::clone(&fail), Arc::clone(&shared));
        let (control_tx, control) = unbounded();
        let (shutdown_tx, shutdown) = bounded(0);

        // A zero flush timeout would make the flush ticker fire continuously.
        let flush_timeout = if self.flush_timeout.is_zero() { DEFAULT_FLUSH_TIMEOUT } else { self.flush_timeout };
        let config = ManagerConfig {
            buffer_size: self.buffer_size,
            flush_timeout,
            write_timeout: self.write_timeout,
            retry_after_min: self.retry_after_min,
            retry_after_max: self.retry_after_max,
        };
        let manager =
            ConnectionManager::new(dialer, protocol, config, pool.clone(), Arc::clone(&shared), Arc::clone(&fail));

        let handle = std::thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.to_string())
            .spawn(move || manager.run(Channels { jobs, control, shutdown }))
            .map_err(|source| BuildError::Backend { name: CONSUMER_THREAD_NAME, source })?;

        Ok(Pipeline::from_inner(Inner {
            queue,
            control: control_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
            shared,
            pool,
            buffer_size: self.buffer_size,
            fail,
        }))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            retry_after_min: DEFAULT_RETRY_AFTER_MIN,
            retry_after_max: DEFAULT_RETRY_AFTER_MAX,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            sample_rate: 1.0,
            pool_size: DEFAULT_POOL_SIZE,
            fail: None,
        }
    }
}
