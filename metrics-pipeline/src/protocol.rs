//! Contracts implemented by backend adapters.
use std::time::SystemTime;

use crate::{error::EncodeError, key::MetricKey, queue::Operation, store::Sample};

/// Encodes streamed metric updates into a backend's wire format.
///
/// Implementations append exactly one complete record to `sink` per call, or return an error and leave the caller to
/// discard whatever was appended. The consumer thread owns the protocol, so implementations may keep scratch state.
pub trait Protocol: Send + 'static {
    /// Encodes a gauge-style replacement.
    ///
    /// # Errors
    ///
    /// If the update cannot be represented in the wire format, an error is returned.
    fn write_set(
        &mut self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        timestamp: SystemTime,
    ) -> Result<(), EncodeError>;

    /// Encodes a counter-style increment.
    ///
    /// # Errors
    ///
    /// If the update cannot be represented in the wire format, an error is returned.
    fn write_add(
        &mut self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        timestamp: SystemTime,
    ) -> Result<(), EncodeError>;

    /// Encodes a histogram observation.
    ///
    /// # Errors
    ///
    /// If the update cannot be represented in the wire format, an error is returned.
    fn write_observe(
        &mut self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        timestamp: SystemTime,
    ) -> Result<(), EncodeError>;

    /// Encodes an update, dispatching on its operation.
    ///
    /// # Errors
    ///
    /// If the update cannot be represented in the wire format, an error is returned.
    fn write(
        &mut self,
        sink: &mut Vec<u8>,
        operation: Operation,
        key: &MetricKey,
        value: f64,
        timestamp: SystemTime,
    ) -> Result<(), EncodeError> {
        match operation {
            Operation::Set => self.write_set(sink, key, value, timestamp),
            Operation::Add => self.write_add(sink, key, value, timestamp),
            Operation::Observe => self.write_observe(sink, key, value, timestamp),
        }
    }
}

/// Encodes aggregated samples into a backend's wire format.
///
/// Serializers are shared between every thread exporting snapshots, so they must not need exclusive access.
pub trait Serializer: Send + Sync {
    /// Appends the records for `sample` to `sink`.
    ///
    /// # Errors
    ///
    /// If the sample cannot be represented in the wire format, an error is returned.
    fn serialize(&self, sink: &mut Vec<u8>, sample: &Sample) -> Result<(), EncodeError>;
}
