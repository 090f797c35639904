//! Streaming telemetry aggregation.
//!
//! Events are routed by identity to worker replicas, merged into
//! double-buffered windows, rolled up to coarser time buckets and persisted
//! in one combined batch per timer round.

pub mod config;
pub mod downsample;
pub mod error;
pub mod event;
pub mod health;
pub mod identity;
pub mod persistence;
pub mod pipeline;
pub mod routing;
pub mod window;
pub mod worker;

pub use error::PipelineError;
pub use pipeline::Pipeline;
