use std::sync::atomic::{AtomicU8, Ordering};

use crate::{atomic::AtomicU64, connection::ConnectionState};

/// Counters describing what a pipeline has done so far.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Jobs accepted onto the delivery queue.
    pub jobs_enqueued: u64,

    /// Jobs skipped by sampling.
    pub jobs_sampled_out: u64,

    /// Jobs dropped because the queue was full or closed.
    pub jobs_dropped: u64,

    /// Pre-encoded payloads accepted onto the delivery queue.
    pub payloads_enqueued: u64,

    /// Payloads written to the backend.
    pub flushes: u64,

    /// Bytes written to the backend.
    pub bytes_written: u64,

    /// Bytes discarded after a failed write or while disconnected.
    pub bytes_lost: u64,

    /// Failed writes.
    pub write_errors: u64,

    /// Failed dial attempts.
    pub dial_errors: u64,

    /// Successful dials.
    pub connects: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: AtomicU8,
    jobs_enqueued: AtomicU64,
    jobs_sampled_out: AtomicU64,
    jobs_dropped: AtomicU64,
    payloads_enqueued: AtomicU64,
    flushes: AtomicU64,
    bytes_written: AtomicU64,
    bytes_lost: AtomicU64,
    write_errors: AtomicU64,
    dial_errors: AtomicU64,
    connects: AtomicU64,
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl Shared {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn job_enqueued(&self) {
        bump(&self.jobs_enqueued, 1);
    }

    pub fn job_sampled_out(&self) {
        bump(&self.jobs_sampled_out, 1);
    }

    pub fn job_dropped(&self) {
        bump(&self.jobs_dropped, 1);
    }

    pub fn payload_enqueued(&self) {
        bump(&self.payloads_enqueued, 1);
    }

    pub fn flushed(&self, bytes: usize) {
        bump(&self.flushes, 1);
        bump(&self.bytes_written, bytes);
    }

    pub fn lost(&self, bytes: usize) {
        bump(&self.bytes_lost, bytes);
    }

    pub fn write_failed(&self) {
        bump(&self.write_errors, 1);
    }

    pub fn dial_failed(&self) {
        bump(&self.dial_errors, 1);
    }

    pub fn connected(&self) {
        bump(&self.connects, 1);
    }

    pub fn snapshot(&self) -> Stats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Stats {
            jobs_enqueued: load(&self.jobs_enqueued),
            jobs_sampled_out: load(&self.jobs_sampled_out),
            jobs_dropped: load(&self.jobs_dropped),
            payloads_enqueued: load(&self.payloads_enqueued),
            flushes: load(&self.flushes),
            bytes_written: load(&self.bytes_written),
            bytes_lost: load(&self.bytes_lost),
            write_errors: load(&self.write_errors),
            dial_errors: load(&self.dial_errors),
            connects: load(&self.connects),
        }
    }
}
