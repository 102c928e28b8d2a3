//! Trace and span id generation.

use crate::trace::{SpanId, TraceId};
use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// Interface for generating new trace and span ids.
///
/// Uniqueness is the only requirement; the ids carry no cryptographic
/// meaning.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`.
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] implementation.
///
/// Generates ids from a per-thread random number generator.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(rng.borrow_mut().gen::<u64>()))
    }
}

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

/// [`IdGenerator`] that increments a counter for each new id, producing
/// predictable ids for tests.
#[derive(Clone, Debug)]
pub struct IncrementIdGenerator(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl IncrementIdGenerator {
    /// Create a new `IncrementIdGenerator` starting from 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for IncrementIdGenerator {
    fn default() -> Self {
        Self(std::sync::Arc::new(std::sync::atomic::AtomicU64::new(1)))
    }
}

impl IdGenerator for IncrementIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as u128)
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_valid_and_distinct() {
        let generator = RandomIdGenerator::default();
        let a = generator.new_trace_id();
        let b = generator.new_trace_id();
        assert_ne!(a, TraceId::INVALID);
        assert_ne!(a, b);

        let a = generator.new_span_id();
        let b = generator.new_span_id();
        assert_ne!(a, SpanId::INVALID);
        assert_ne!(a, b);
    }

    #[test]
    fn increment_ids_are_predictable() {
        let generator = IncrementIdGenerator::new();
        assert_eq!(generator.new_trace_id(), TraceId::from(1u128));
        assert_eq!(generator.new_span_id(), SpanId::from(2u64));
    }
}
