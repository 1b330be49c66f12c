//! The single consumer that owns the outbound connection.
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{never, select, tick, Receiver, Sender};
use tracing::{debug, error, trace, warn};

mod backoff;
pub(crate) use self::backoff::Backoff;

use crate::{
    buffer::{ChunkPool, PooledBuffer, SharedBuffer},
    error::{Error, FailCallback},
    protocol::Protocol,
    queue::{Job, Message},
    stats::Shared,
    transport::{Connection as _, Dialer},
};

/// Lifecycle of the pipeline's connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Nothing has been written yet, so no connection has been attempted.
    Idle = 0,

    /// Dialing the backend.
    Connecting = 1,

    /// Connected and writing.
    Connected = 2,

    /// The last dial or write failed. The next write will dial again.
    Disconnected = 3,

    /// Draining the queue and writing what remains before shutting down.
    Closing = 4,

    /// Shut down.
    Closed = 5,
}

impl ConnectionState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

pub(crate) enum Control {
    Flush(Sender<Result<(), Error>>),
}

#[derive(Clone, Debug)]
pub(crate) struct ManagerConfig {
    pub buffer_size: usize,
    pub flush_timeout: Duration,
    pub write_timeout: Duration,
    pub retry_after_min: Duration,
    pub retry_after_max: Duration,
}

pub(crate) struct Channels {
    pub jobs: Receiver<Message>,
    pub control: Receiver<Control>,
    pub shutdown: Receiver<()>,
}

struct Signals {
    control: Receiver<Control>,
    shutdown: Receiver<()>,
}

#[derive(Clone, Copy)]
enum Retry {
    Once,
    UntilShutdown,
}

/// Drains the delivery queue, encodes and batches jobs, and writes them over a single connection.
///
/// Only this loop ever touches the connection, so writes need no synchronization. Buffered bytes are written when the
/// buffer fills, when the flush interval elapses, when a flush is requested, and when the queue closes.
pub(crate) struct ConnectionManager<D: Dialer, P> {
    dialer: D,
    protocol: P,
    config: ManagerConfig,
    connection: Option<D::Connection>,
    buffer: SharedBuffer,
    backoff: Backoff,
    shared: Arc<Shared>,
    fail: FailCallback,
    last_error: Option<Error>,
}

impl<D, P> ConnectionManager<D, P>
where
    D: Dialer,
    P: Protocol,
{
    pub fn new(
        dialer: D,
        protocol: P,
        config: ManagerConfig,
        pool: ChunkPool,
        shared: Arc<Shared>,
        fail: FailCallback,
    ) -> Self {
        let buffer = SharedBuffer::new(pool, config.buffer_size);
        let backoff = Backoff::new(config.retry_after_min, config.retry_after_max);
        Self { dialer, protocol, config, connection: None, buffer, backoff, shared, fail, last_error: None }
    }

    /// Runs until the delivery queue is closed and drained.
    ///
    /// Returns the last write error observed since the last explicit flush, or the error that stopped the closing flush.
    pub fn run(mut self, channels: Channels) -> Option<Error> {
        let Channels { jobs, control, shutdown } = channels;
        let mut signals = Signals { control, shutdown };
        let ticker = tick(self.config.flush_timeout);

        debug!(transport = self.dialer.transport_id(), "Connection manager started.");
        self.shared.set_state(ConnectionState::Idle);

        loop {
            let mut control_closed = false;
            select! {
                recv(jobs) -> msg => match msg {
                    Ok(msg) => self.process(msg, &signals),
                    Err(_) => break,
                },
                recv(signals.control) -> request => match request {
                    Ok(Control::Flush(reply)) => {
                        let result = self.explicit_flush(&jobs, &signals);
                        let _ = reply.send(result);
                    }
                    Err(_) => control_closed = true,
                },
                recv(ticker) -> _ => {
                    let _ = self.flush_pending(Retry::UntilShutdown, &signals);
                },
            }

            if control_closed {
                signals.control = never();
            }
        }

        self.shared.set_state(ConnectionState::Closing);
        debug!(pending_bytes = self.buffer.len(), "Delivery queue closed; writing remaining metrics.");
        if let Err(error) = self.flush_pending(Retry::UntilShutdown, &signals) {
            self.last_error = Some(self.abandon().unwrap_or(error));
        }

        self.connection = None;
        self.shared.set_state(ConnectionState::Closed);
        debug!("Connection manager stopped.");
        self.last_error.take()
    }

    fn process(&mut self, msg: Message, signals: &Signals) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let chunk = match msg {
                Message::Job(job) => match self.encode(&job) {
                    Some(chunk) => chunk,
                    None => return,
                },
                Message::Payload(payload) => payload,
            };

            for payload in self.buffer.merge(chunk) {
                let _ = self.write_out(&payload, Retry::UntilShutdown, signals);
            }
        }));

        if let Err(payload) = result {
            let error = Error::Panicked { context: "processing a metric", message: panic_message(payload.as_ref()) };
            error!(%error, "Recovered from panic in connection manager.");
            self.report(&error);
        }
    }

    fn encode(&mut self, job: &Job) -> Option<PooledBuffer> {
        let mut chunk = self.buffer.pool().acquire();
        match self.protocol.write(&mut chunk, job.operation, &job.key, job.value, job.timestamp) {
            Ok(()) => Some(chunk),
            Err(source) => {
                let error = Error::Encode { key: job.key.encoded().to_string(), source };
                debug!(%error, "Failed to encode metric.");
                self.report(&error);
                None
            }
        }
    }

    fn explicit_flush(&mut self, jobs: &Receiver<Message>, signals: &Signals) -> Result<(), Error> {
        // Only drain what was queued before the request, so a busy producer cannot hold the flush off forever.
        for _ in 0..jobs.len() {
            match jobs.try_recv() {
                Ok(msg) => self.process(msg, signals),
                Err(_) => break,
            }
        }

        self.flush_pending(Retry::Once, signals)?;
        match self.last_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn flush_pending(&mut self, retry: Retry, signals: &Signals) -> Result<(), Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.ensure_connected(retry, signals)?;
        match self.buffer.take() {
            Some(payload) => self.write_out(&payload, retry, signals),
            None => Ok(()),
        }
    }

    fn write_out(&mut self, payload: &[u8], retry: Retry, signals: &Signals) -> Result<(), Error> {
        if let Err(error) = self.ensure_connected(retry, signals) {
            self.shared.lost(payload.len());
            return Err(error);
        }

        let write_timeout = self.config.write_timeout;
        let result = match self.connection.as_mut() {
            Some(connection) => {
                connection.set_write_timeout(write_timeout).and_then(|()| connection.write_payload(payload))
            }
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        };

        match result {
            Ok(()) => {
                self.shared.flushed(payload.len());
                trace!(bytes = payload.len(), "Flushed payload.");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, bytes = payload.len(), "Failed to write payload; dropping connection.");
                self.connection = None;
                self.shared.set_state(ConnectionState::Disconnected);
                self.shared.write_failed();
                self.shared.lost(payload.len());

                let error = Error::write(payload.len(), e);
                self.last_error = Some(error.clone());
                self.report(&error);
                Err(error)
            }
        }
    }

    fn ensure_connected(&mut self, retry: Retry, signals: &Signals) -> Result<(), Error> {
        if self.connection.is_some() {
            return Ok(());
        }

        loop {
            self.shared.set_state(ConnectionState::Connecting);
            match self.dialer.dial() {
                Ok(connection) => {
                    self.backoff.reset();
                    self.connection = Some(connection);
                    self.shared.connected();
                    self.shared.set_state(ConnectionState::Connected);
                    debug!(transport = self.dialer.transport_id(), "Connected.");
                    return Ok(());
                }
                Err(e) => {
                    let error = Error::dial(self.dialer.transport_id(), e);
                    self.shared.dial_failed();
                    self.shared.set_state(ConnectionState::Disconnected);
                    self.report(&error);

                    match retry {
                        Retry::Once => {
                            warn!(%error, "Failed to connect.");
                            return Err(error);
                        }
                        Retry::UntilShutdown => {
                            let delay = self.backoff.next_delay();
                            warn!(%error, retry_after = ?delay, "Failed to connect; backing off.");
                            if !wait(delay, &error, signals) {
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }
    }

    fn abandon(&mut self) -> Option<Error> {
        let pending = self.buffer.take()?;
        self.shared.lost(pending.len());

        let error = Error::Abandoned { bytes: pending.len() };
        warn!(%error, "Discarding undelivered metrics.");
        self.report(&error);
        Some(error)
    }

    fn report(&self, error: &Error) {
        (self.fail)(error);
    }
}

/// Sleeps for `delay` unless shutdown is signalled first.
///
/// Flush requests that arrive while waiting are answered with `last` rather than left blocked behind the backoff.
/// Returns `false` if shutdown was signalled.
fn wait(delay: Duration, last: &Error, signals: &Signals) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }

        select! {
            recv(signals.shutdown) -> _ => return false,
            recv(signals.control) -> request => match request {
                Ok(Control::Flush(reply)) => {
                    let _ = reply.send(Err(last.clone()));
                }
                Err(_) => return false,
            },
            default(remaining) => return true,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
