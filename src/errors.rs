use std::sync::Arc;

use crossbeam::queue::SegQueue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type returned by transforms, sources and sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a stage while processing an item.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("pipeline stage {position}: {source}")]
    Transform {
        position: usize,
        #[source]
        source: BoxError,
    },
    #[error("pipeline stage {position}: panic: {message}")]
    Panic { position: usize, message: String },
}

impl StageError {
    pub fn transform(position: usize, source: BoxError) -> Self {
        StageError::Transform { position, source }
    }

    pub fn panic(position: usize, message: impl Into<String>) -> Self {
        StageError::Panic {
            position,
            message: message.into(),
        }
    }

    #[inline]
    pub fn position(&self) -> usize {
        match self {
            StageError::Transform { position, .. } | StageError::Panic { position, .. } => {
                *position
            }
        }
    }
}

/// Error returned by [`Pipeline::process`](crate::pipeline::Pipeline::process).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline source: {0}")]
    Source(#[source] BoxError),
    #[error("pipeline sink: {0}")]
    Sink(#[source] BoxError),
    #[error("{} stage error(s) reported", .0.len())]
    Stages(Vec<StageError>),
}

/// Append-only collector of stage failures shared by every worker of a run.
///
/// Appending never blocks. When built with [`ErrorSink::tripping`], the first
/// append also cancels the given token.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink {
    queue: Arc<SegQueue<StageError>>,
    trip: Option<CancellationToken>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tripping(token: CancellationToken) -> Self {
        Self {
            queue: Arc::new(SegQueue::new()),
            trip: Some(token),
        }
    }

    pub fn append(&self, err: StageError) {
        self.queue.push(err);
        if let Some(token) = &self.trip {
            token.cancel();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes every error collected so far, oldest first.
    pub fn drain(&self) -> Vec<StageError> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(err) = self.queue.pop() {
            out.push(err);
        }
        out
    }
}
