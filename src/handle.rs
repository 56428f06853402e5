use super::{
    errors::{ErrorSink, StageError},
    model::Payload,
    stage::{Stage, StageParams},
};
use std::{any::Any, future::Future, sync::Arc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};


/// Group of replica tasks owned by one stage run.
///
/// Replicas are aborted if the set is dropped before [`ReplicaSet::join`].
pub struct ReplicaSet {
    position: usize,
    errors: ErrorSink,
    tasks: JoinSet<()>,
}

impl ReplicaSet {
    pub fn new(position: usize, errors: ErrorSink) -> Self {
        Self {
            position,
            errors,
            tasks: JoinSet::new(),
        }
    }

    #[inline]
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Spawns `stage.run(cancel, params)` as a replica.
    pub fn spawn_stage<P, S>(&mut self, stage: &Arc<S>, cancel: &CancellationToken, params: StageParams<P>)
    where
        P: Payload,
        S: Stage<P> + ?Sized + 'static,
    {
        let stage = Arc::clone(stage);
        let cancel = cancel.clone();
        self.spawn(async move {
            stage.run(&cancel, params).await;
        });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every replica. A panicking replica is reported to the error
    /// sink and does not affect its siblings.
    pub async fn join(mut self) {
        let total = self.tasks.len();
        while let Some(res) = self.tasks.join_next().await {
            if let Err(join_err) = res {
                if join_err.is_panic() {
                    let message = panic_message(join_err.into_panic().as_ref());
                    warn!(position = self.position, %message, "replica panicked");
                    self.errors.append(StageError::panic(self.position, message));
                } else {
                    warn!(position = self.position, error = %join_err, "replica did not complete");
                }
            }
        }
        debug!(position = self.position, replicas = total, "all replicas joined");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in spawned task".into()
    }
}
