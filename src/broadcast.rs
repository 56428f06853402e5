use super::{
    handle::ReplicaSet,
    model::Payload,
    pool::Config,
    stage::{feed, recv_or_cancel, send_or_cancel, Fifo, SharedProcessor, Stage, StageParams},
};
use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;


/// Hands every input item to each of its branches.
///
/// Branch `i` runs the `i`-th processor sequentially on a private feed. All
/// branches write to the same output, so outputs of different branches may
/// interleave in any order.
pub struct Broadcast<P: Payload> {
    branches: Vec<Arc<Fifo<P>>>,
    feed_capacity: usize,
}

impl<P: Payload> Broadcast<P> {
    /// Returns `None` when `processors` is empty.
    pub fn new(processors: Vec<SharedProcessor<P>>) -> Option<Self> {
        Self::build(processors, 1)
    }

    pub fn with_config(processors: Vec<SharedProcessor<P>>, config: &Config) -> Option<Self> {
        Self::build(processors, config.feed_capacity)
    }

    fn build(processors: Vec<SharedProcessor<P>>, feed_capacity: usize) -> Option<Self> {
        if processors.is_empty() {
            return None;
        }

        let branches = processors
            .into_iter()
            .map(|processor| Arc::new(Fifo::new(processor)))
            .collect();

        Some(Self { branches, feed_capacity })
    }

    #[inline]
    pub fn branches(&self) -> usize {
        self.branches.len()
    }
}

#[async_trait]
impl<P: Payload> Stage<P> for Broadcast<P> {
    async fn run(&self, cancel: &CancellationToken, params: StageParams<P>) {
        let mut replicas = ReplicaSet::new(params.position, params.errors.clone());
        let mut inputs = Vec::with_capacity(self.branches.len());

        for branch in &self.branches {
            let (tx, input) = feed(self.feed_capacity);
            let branch_params = StageParams::new(
                params.position,
                input,
                params.output.clone(),
                params.errors.clone(),
            );
            replicas.spawn_stage(branch, cancel, branch_params);
            inputs.push(tx);
        }
        debug!(position = params.position, replicas = replicas.len(), "broadcast started");

        if let Some((first, rest)) = inputs.split_first() {
            'recv: while let Some(payload) = recv_or_cancel(cancel, &params.input).await {
                // Copies go out highest index first; branch 0 gets the original.
                for tx in rest.iter().rev() {
                    if !send_or_cancel(cancel, tx, payload.clone()).await {
                        break 'recv;
                    }
                }
                if !send_or_cancel(cancel, first, payload).await {
                    break;
                }
            }
        }

        // Closing the private feeds lets every branch finish what it holds.
        drop(inputs);
        drop(params);
        replicas.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Unit;
    impl Payload for Unit {}

    #[test]
    fn empty_broadcast_is_not_built() {
        assert!(Broadcast::<Unit>::new(Vec::new()).is_none());
    }
}
