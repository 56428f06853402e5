use super::{
    errors::{BoxError, ErrorSink, StageError},
    model::{Outcome, Payload},
};
use std::{future::Future, sync::Arc};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};


/// Per-item transform run by a stage.
///
/// Any `Fn(CancellationToken, P) -> impl Future<Output = Result<Outcome<P>, BoxError>>`
/// closure is a processor.
#[async_trait]
pub trait Processor<P: Payload>: Send + Sync {
    async fn process(&self, cancel: &CancellationToken, payload: P) -> Result<Outcome<P>, BoxError>;
}

#[async_trait]
impl<P, F, Fut> Processor<P> for F
where
    P: Payload,
    F: Fn(CancellationToken, P) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome<P>, BoxError>> + Send + 'static,
{
    async fn process(&self, cancel: &CancellationToken, payload: P) -> Result<Outcome<P>, BoxError> {
        self(cancel.clone(), payload).await
    }
}

pub type SharedProcessor<P> = Arc<dyn Processor<P>>;

/// A unit of pipeline execution.
///
/// `run` consumes `params.input` until it closes or `cancel` fires, and only
/// returns once all work it started has finished.
#[async_trait]
pub trait Stage<P: Payload>: Send + Sync {
    async fn run(&self, cancel: &CancellationToken, params: StageParams<P>);
}

pub type SharedStage<P> = Arc<dyn Stage<P>>;

/// Receiving end of a feed. Clones share the same queue and every item is
/// delivered to exactly one of them.
pub struct InputFeed<P> {
    rx: Arc<Mutex<mpsc::Receiver<P>>>,
}

impl<P> Clone for InputFeed<P> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

impl<P> InputFeed<P> {
    pub fn new(rx: mpsc::Receiver<P>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Cancel safe: dropping the future never loses an item.
    pub async fn recv(&self) -> Option<P> {
        self.rx.lock().await.recv().await
    }
}

/// Creates a bounded feed. A zero capacity is raised to one.
pub fn feed<P>(capacity: usize) -> (mpsc::Sender<P>, InputFeed<P>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, InputFeed::new(rx))
}

/// Everything a stage is handed by the driver for one run.
#[derive(Clone)]
pub struct StageParams<P> {
    pub position: usize,
    pub input: InputFeed<P>,
    pub output: mpsc::Sender<P>,
    pub errors: ErrorSink,
}

impl<P> StageParams<P> {
    pub fn new(
        position: usize,
        input: InputFeed<P>,
        output: mpsc::Sender<P>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            position,
            input,
            output,
            errors,
        }
    }
}

/// Waits for the next input item unless `cancel` fires first.
#[inline]
pub(crate) async fn recv_or_cancel<P>(cancel: &CancellationToken, input: &InputFeed<P>) -> Option<P> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        next = input.recv() => next,
    }
}

/// Sends `payload` unless `cancel` fires first. Returns false when the item
/// was dropped, either on cancellation or because the receiver is gone.
#[inline]
pub(crate) async fn send_or_cancel<P>(
    cancel: &CancellationToken,
    output: &mpsc::Sender<P>,
    payload: P,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = output.send(payload) => sent.is_ok(),
    }
}


/// Sequential stage: one item at a time, in input order.
pub struct Fifo<P: Payload> {
    processor: SharedProcessor<P>,
}

impl<P: Payload> Fifo<P> {
    pub fn new(processor: SharedProcessor<P>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl<P: Payload> Stage<P> for Fifo<P> {
    async fn run(&self, cancel: &CancellationToken, params: StageParams<P>) {
        while let Some(payload) = recv_or_cancel(cancel, &params.input).await {
            match self.processor.process(cancel, payload).await {
                Ok(Outcome::Emit(out)) => {
                    if !send_or_cancel(cancel, &params.output, out).await {
                        trace!(position = params.position, "output dropped, fifo stopping");
                        break;
                    }
                }
                Ok(Outcome::Processed(done)) => done.mark_as_processed(),
                Err(err) => {
                    warn!(position = params.position, error = %err, "transform failed");
                    params.errors.append(StageError::transform(params.position, err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static MARKED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, PartialEq)]
    struct Num(i64);

    impl Payload for Num {
        fn mark_as_processed(self) {
            MARKED.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shared<F, Fut>(f: F) -> SharedProcessor<Num>
    where
        F: Fn(CancellationToken, Num) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome<Num>, BoxError>> + Send + 'static,
    {
        Arc::new(f)
    }

    #[tokio::test]
    async fn fifo_preserves_order_and_reports_errors() {
        let fifo = Fifo::new(shared(|_, n: Num| async move {
            match n.0 {
                3 => Err::<Outcome<Num>, BoxError>("three is bad".into()),
                5 => Ok(Outcome::Processed(n)),
                _ => Ok(Outcome::Emit(Num(n.0 * 10))),
            }
        }));

        let (in_tx, input) = feed(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let errors = ErrorSink::new();
        let params = StageParams::new(2, input, out_tx, errors.clone());

        for i in 1..=6 {
            in_tx.send(Num(i)).await.unwrap();
        }
        drop(in_tx);

        let before = MARKED.load(Ordering::SeqCst);
        fifo.run(&CancellationToken::new(), params).await;

        let mut got = Vec::new();
        while let Some(n) = out_rx.recv().await {
            got.push(n.0);
        }
        assert_eq!(got, vec![10, 20, 40, 60]);
        assert_eq!(MARKED.load(Ordering::SeqCst) - before, 1);

        let errs = errors.drain();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].to_string(), "pipeline stage 2: three is bad");
    }

    #[tokio::test]
    async fn fifo_returns_on_cancel_while_waiting_for_input() {
        let fifo = Fifo::new(shared(|_, n: Num| async move { Ok::<_, BoxError>(Outcome::Emit(n)) }));
        let (_in_tx, input) = feed::<Num>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let params = StageParams::new(0, input, out_tx, ErrorSink::new());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), fifo.run(&cancel, params))
            .await
            .expect("fifo must observe cancellation");
    }

    #[tokio::test]
    async fn input_feed_clones_share_one_queue() {
        let (tx, input) = feed(4);
        let other = input.clone();
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(input.recv().await, Some(1));
        assert_eq!(other.recv().await, Some(2));
        assert_eq!(input.recv().await, None);
    }
}
