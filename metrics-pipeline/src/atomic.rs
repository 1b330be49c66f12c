use std::sync::atomic::Ordering;

#[cfg(target_pointer_width = "32")]
pub(crate) use portable_atomic::AtomicU64;
#[cfg(not(target_pointer_width = "32"))]
pub(crate) use std::sync::atomic::AtomicU64;

/// A floating-point value that can be updated concurrently without locks.
///
/// The value is stored as the raw bit pattern of an `f64` inside an atomic 64-bit integer. Additive updates load the
/// current bits, compute the new value, and attempt to compare-and-swap it into place, retrying if another writer won
/// the race in between. No update is ever lost, and readers always observe a value that some writer actually stored.
///
/// On 32-bit platforms without native 64-bit atomics, the fallback from `portable-atomic` is used.
#[derive(Debug)]
pub struct AtomicValue {
    bits: AtomicU64,
}

impl AtomicValue {
    /// Creates a new `AtomicValue` holding `value`.
    pub fn new(value: f64) -> Self {
        Self { bits: AtomicU64::new(value.to_bits()) }
    }

    /// Adds `delta` to the value, returning the new value.
    pub fn add(&self, delta: f64) -> f64 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let updated = f64::from_bits(current) + delta;
            match self.bits.compare_exchange_weak(
                current,
                updated.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return updated,
                Err(actual) => current = actual,
            }
        }
    }

    /// Replaces the value with `value`.
    ///
    /// Returns the new value and the difference between it and the value it replaced.
    pub fn set(&self, value: f64) -> (f64, f64) {
        let previous = f64::from_bits(self.bits.swap(value.to_bits(), Ordering::AcqRel));
        (value, value - previous)
    }

    /// Reads the current value.
    pub fn read(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

impl Default for AtomicValue {
    fn default() -> Self {
        Self::new(0.0)
    }
}
