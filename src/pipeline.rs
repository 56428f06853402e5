use super::{
    errors::{BoxError, ErrorSink, PipelineError, StageError},
    handle::panic_message,
    model::Payload,
    pool::Config,
    stage::{feed, recv_or_cancel, send_or_cancel, InputFeed, SharedStage, StageParams},
};
use std::{panic::AssertUnwindSafe, sync::Arc};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};


/// Produces the items that enter the first stage.
#[async_trait]
pub trait Source<P: Payload>: Send + 'static {
    /// `Ok(None)` ends the stream.
    async fn next(&mut self, cancel: &CancellationToken) -> Result<Option<P>, BoxError>;
}

/// Receives everything the last stage emits.
#[async_trait]
pub trait Sink<P: Payload>: Send + 'static {
    async fn consume(&mut self, cancel: &CancellationToken, payload: P) -> Result<(), BoxError>;
}

/// Chains stages through bounded feeds and runs them against a source and a sink.
pub struct Pipeline<P: Payload> {
    stages: Vec<SharedStage<P>>,
    config: Config,
}

impl<P: Payload> Pipeline<P> {
    pub fn new(stages: Vec<SharedStage<P>>) -> Self {
        Self::with_config(stages, Config::default())
    }

    pub fn with_config(stages: Vec<SharedStage<P>>, config: Config) -> Self {
        Self { stages, config }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage until the source is exhausted and all items have
    /// drained into the sink, or until `cancel` fires.
    ///
    /// A source or sink failure stops the run and is returned as is. Otherwise
    /// every error the stages reported is returned together.
    pub async fn process<S, K>(&self, cancel: &CancellationToken, source: S, sink: K) -> Result<(), PipelineError>
    where
        S: Source<P>,
        K: Sink<P>,
    {
        let run = cancel.child_token();
        let errors = if self.config.cancel_on_error {
            ErrorSink::tripping(run.clone())
        } else {
            ErrorSink::new()
        };

        let mut workers: JoinSet<Result<(), PipelineError>> = JoinSet::new();
        let (source_tx, mut next_input) = feed(self.config.feed_capacity);

        for (position, stage) in self.stages.iter().enumerate() {
            let (tx, following) = feed(self.config.feed_capacity);
            let input = std::mem::replace(&mut next_input, following);
            let stage = Arc::clone(stage);
            let token = run.clone();
            let errors = errors.clone();

            workers.spawn(async move {
                let params = StageParams::new(position, input, tx, errors.clone());
                if let Err(panic) = AssertUnwindSafe(stage.run(&token, params)).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    warn!(position, %message, "stage panicked");
                    errors.append(StageError::panic(position, message));
                }
                Ok(())
            });
        }
        debug!(stages = self.stages.len(), "pipeline started");

        workers.spawn(pump_source(source, source_tx, run.clone()));
        workers.spawn(drain_into_sink(sink, next_input, run.clone()));

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "pipeline worker failed");
                    run.cancel();
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "pipeline worker did not complete");
                    run.cancel();
                }
            }
        }

        let reported = errors.drain();
        debug!(errors = reported.len(), "pipeline finished");

        match failure {
            Some(err) => Err(err),
            None if !reported.is_empty() => Err(PipelineError::Stages(reported)),
            None => Ok(()),
        }
    }
}

async fn pump_source<P, S>(mut source: S, output: mpsc::Sender<P>, cancel: CancellationToken) -> Result<(), PipelineError>
where
    P: Payload,
    S: Source<P>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = AssertUnwindSafe(source.next(&cancel)).catch_unwind() => next,
        };

        let payload = match next {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(err)) => return Err(PipelineError::Source(err)),
            Err(panic) => return Err(PipelineError::Source(panic_message(panic.as_ref()).into())),
        };

        if !send_or_cancel(&cancel, &output, payload).await {
            return Ok(());
        }
    }
}

async fn drain_into_sink<P, K>(mut sink: K, input: InputFeed<P>, cancel: CancellationToken) -> Result<(), PipelineError>
where
    P: Payload,
    K: Sink<P>,
{
    while let Some(payload) = recv_or_cancel(&cancel, &input).await {
        match AssertUnwindSafe(sink.consume(&cancel, payload)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(PipelineError::Sink(err)),
            Err(panic) => return Err(PipelineError::Sink(panic_message(panic.as_ref()).into())),
        }
    }
    Ok(())
}
