#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::{render, InstrumentedProcessor, JobStatsGauges};
