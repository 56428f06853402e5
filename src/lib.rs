//! Concurrent fan-out / fan-in stages for async data pipelines
//!
//! # Stages
//! - [`FixedPool`]: N sequential replicas sharing one input and one output
//! - [`DynamicPool`]: one task per item, bounded by a permit semaphore
//! - [`Broadcast`]: every item goes to every branch, branch 0 gets the original
//! - [`Fifo`]: the sequential building block the others wrap
//!
//! Every stage reacts to a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! at each blocking point and only returns once its own tasks have finished.
//! Transform failures never stop a stage; they are collected in an [`ErrorSink`].

pub mod broadcast;
pub mod errors;
pub mod handle;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod stage;

pub use broadcast::Broadcast;
pub use errors::{BoxError, ErrorSink, PipelineError, StageError};
pub use model::{Outcome, Payload, PoolMetrics};
pub use pipeline::{Pipeline, Sink, Source};
pub use pool::{Config, DynamicPool, FixedPool};
pub use stage::{feed, Fifo, InputFeed, Processor, SharedProcessor, SharedStage, Stage, StageParams};
