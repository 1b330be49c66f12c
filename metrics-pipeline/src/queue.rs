use std::{
    sync::Arc,
    time::SystemTime,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    buffer::PooledBuffer,
    error::{Error, FailCallback},
    key::MetricKey,
    stats::Shared,
};

/// What a job does to its metric.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// Replace the current value.
    Set,

    /// Add to the current value.
    Add,

    /// Record an observation.
    Observe,
}

/// A single metric update on its way to the backend.
#[derive(Clone, Debug)]
pub struct Job {
    /// Identity of the metric.
    pub key: MetricKey,

    /// Value carried by the update.
    pub value: f64,

    /// When the update was made.
    pub timestamp: SystemTime,

    /// What to do with the value.
    pub operation: Operation,
}

impl Job {
    /// Creates a new `Job` timestamped with the current time.
    pub fn new(key: MetricKey, operation: Operation, value: f64) -> Self {
        Self { key, value, timestamp: SystemTime::now(), operation }
    }
}

pub(crate) enum Message {
    Job(Job),
    Payload(PooledBuffer),
}

/// Outcome of handing a job to the delivery queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Enqueued {
    /// Accepted for delivery.
    Queued,

    /// Skipped by sampling.
    SampledOut,

    /// Dropped because the queue was full or closed. The failure callback has been invoked.
    Dropped,
}

/// Bounded, non-blocking handoff from producers to the connection consumer.
///
/// Producers never block: when the queue is full or closed the job is dropped on the spot and reported through the
/// failure callback.
pub(crate) struct DeliveryQueue {
    tx: RwLock<Option<Sender<Message>>>,
    capacity: usize,
    sample_rate: f64,
    fail: FailCallback,
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    pub fn new(
        capacity: usize,
        sample_rate: f64,
        fail: FailCallback,
        shared: Arc<Shared>,
    ) -> (Self, Receiver<Message>) {
        let (tx, rx) = bounded(capacity);
        let queue = Self { tx: RwLock::new(Some(tx)), capacity, sample_rate, fail, shared };
        (queue, rx)
    }

    pub fn enqueue(&self, job: Job) -> Enqueued {
        if !self.sampled() {
            self.shared.job_sampled_out();
            return Enqueued::SampledOut;
        }

        let result = self.send(Message::Job(job));
        if result == Enqueued::Queued {
            self.shared.job_enqueued();
        }
        result
    }

    pub fn send_payload(&self, payload: PooledBuffer) -> Enqueued {
        let result = self.send(Message::Payload(payload));
        if result == Enqueued::Queued {
            self.shared.payload_enqueued();
        }
        result
    }

    fn send(&self, message: Message) -> Enqueued {
        let error = {
            let tx = self.tx.read();
            match tx.as_ref() {
                None => Error::QueueClosed,
                Some(tx) => match tx.try_send(message) {
                    Ok(()) => return Enqueued::Queued,
                    Err(TrySendError::Full(_)) => Error::QueueFull { capacity: self.capacity },
                    Err(TrySendError::Disconnected(_)) => Error::QueueClosed,
                },
            }
        };

        self.shared.job_dropped();
        debug!(%error, "Dropped metric.");
        self.report(&error);
        Enqueued::Dropped
    }

    fn sampled(&self) -> bool {
        self.sample_rate >= 1.0 || rand::random_bool(self.sample_rate)
    }

    pub fn report(&self, error: &Error) {
        (self.fail)(error);
    }

    /// Closes the queue. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tx.write().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{DeliveryQueue, Enqueued, Job, Message, Operation};
    use crate::{
        error::{Error, FailCallback},
        key::{MetricKey, MetricKind, Tag},
        stats::Shared,
    };

    fn job() -> Job {
        Job::new(MetricKey::new(MetricKind::Counter, "hits", Vec::<Tag>::new()), Operation::Add, 1.0)
    }

    fn counting_callback() -> (FailCallback, Arc<AtomicUsize>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let messages = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let callback = {
            let count = Arc::clone(&count);
            let messages = Arc::clone(&messages);
            Arc::new(move |error: &Error| {
                count.fetch_add(1, Ordering::SeqCst);
                messages.lock().push(error.to_string());
            }) as FailCallback
        };
        (callback, count, messages)
    }

    #[test]
    fn zero_capacity_queue_drops_without_consumer() {
        let (fail, count, messages) = counting_callback();
        let shared = Arc::new(Shared::default());
        let (queue, _rx) = DeliveryQueue::new(0, 1.0, fail, Arc::clone(&shared));

        assert_eq!(queue.enqueue(job()), Enqueued::Dropped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(messages.lock()[0].contains("full"));
        assert_eq!(shared.snapshot().jobs_dropped, 1);
        assert_eq!(shared.snapshot().jobs_enqueued, 0);
    }

    #[test]
    fn full_queue_drops_and_keeps_earlier_jobs() {
        let (fail, count, _) = counting_callback();
        let shared = Arc::new(Shared::default());
        let (queue, rx) = DeliveryQueue::new(2, 1.0, fail, Arc::clone(&shared));

        assert_eq!(queue.enqueue(job()), Enqueued::Queued);
        assert_eq!(queue.enqueue(job()), Enqueued::Queued);
        assert_eq!(queue.enqueue(job()), Enqueued::Dropped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(rx.len(), 2);

        assert!(matches!(rx.try_recv(), Ok(Message::Job(_))));
        assert_eq!(queue.enqueue(job()), Enqueued::Queued);
        assert_eq!(shared.snapshot().jobs_enqueued, 3);
    }

    #[test]
    fn closed_queue_reports_closed() {
        let (fail, count, messages) = counting_callback();
        let (queue, _rx) = DeliveryQueue::new(8, 1.0, fail, Arc::new(Shared::default()));

        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());

        assert_eq!(queue.enqueue(job()), Enqueued::Dropped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(messages.lock()[0].contains("closed"));
    }

    #[test]
    fn sampling_skips_without_reporting() {
        let (fail, count, _) = counting_callback();
        let shared = Arc::new(Shared::default());
        let (queue, rx) = DeliveryQueue::new(10_000, 0.25, fail, Arc::clone(&shared));

        let queued = (0..10_000).filter(|_| queue.enqueue(job()) == Enqueued::Queued).count();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(rx.len(), queued);
        assert!((1_500..3_500).contains(&queued), "queued {queued} of 10000 at rate 0.25");
        assert_eq!(shared.snapshot().jobs_sampled_out as usize, 10_000 - queued);
    }
}
