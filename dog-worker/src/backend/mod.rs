//! Job storage engines.
//!
//! Both engines implement [`JobProcessor`](crate::JobProcessor) and
//! [`DeadJobManager`](crate::DeadJobManager) with the same contract, so the
//! in-memory engine can stand in for the store-backed one in tests.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;
