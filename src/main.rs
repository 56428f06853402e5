use async_pipeline::{
    BoxError, Broadcast, Config, DynamicPool, FixedPool, Outcome, Payload, Pipeline,
    SharedProcessor, SharedStage, Sink, Source,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Reading {
    value: u64,
}

impl Payload for Reading {}

struct Counter {
    next: u64,
    end: u64,
}

#[async_trait]
impl Source<Reading> for Counter {
    async fn next(&mut self, _cancel: &CancellationToken) -> Result<Option<Reading>, BoxError> {
        if self.next == self.end {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(Reading { value: self.next }))
    }
}

#[derive(Default)]
struct Total {
    items: u64,
    sum: u64,
}

struct Tally(Arc<tokio::sync::Mutex<Total>>);

#[async_trait]
impl Sink<Reading> for Tally {
    async fn consume(&mut self, _cancel: &CancellationToken, payload: Reading) -> Result<(), BoxError> {
        let mut total = self.0.lock().await;
        total.items += 1;
        total.sum += payload.value;
        Ok(())
    }
}

fn map(f: fn(u64) -> u64) -> SharedProcessor<Reading> {
    Arc::new(move |_: CancellationToken, r: Reading| async move {
        Ok::<_, BoxError>(Outcome::Emit(Reading { value: f(r.value) }))
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = Builder::new_multi_thread().enable_all().build()?;

    rt.block_on(async {
        let config = Config::io_bound();
        let stages: Vec<SharedStage<Reading>> = vec![
            Arc::new(DynamicPool::with_config(map(|v| v * 2), &config).ok_or("dynamic pool")?),
            Arc::new(Broadcast::with_config(vec![map(|v| v), map(|v| v + 1)], &config).ok_or("broadcast")?),
            Arc::new(FixedPool::with_config(map(|v| v), &config).ok_or("fixed pool")?),
        ];
        let pipeline = Pipeline::with_config(stages, config);

        let total = Arc::new(tokio::sync::Mutex::new(Total::default()));
        let now = Instant::now();
        pipeline
            .process(&CancellationToken::new(), Counter { next: 0, end: 100_000 }, Tally(total.clone()))
            .await?;

        let total = total.lock().await;
        tracing::info!(items = total.items, sum = total.sum, elapsed = ?now.elapsed(), "pipeline done");
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}
