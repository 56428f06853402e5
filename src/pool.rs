use super::{
    errors::{ErrorSink, StageError},
    handle::{panic_message, ReplicaSet},
    model::{Outcome, Payload, PoolMetrics},
    stage::{recv_or_cancel, send_or_cancel, Fifo, SharedProcessor, Stage, StageParams},
};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};


/// Sizing for pools, broadcast feeds and the pipeline driver.
#[derive(Debug, Clone)]
pub struct Config {
    /// Replicas in a [`FixedPool`].
    pub workers: usize,
    /// Permit ceiling of a [`DynamicPool`].
    pub max_in_flight: usize,
    /// Buffer of every feed created by the crate.
    pub feed_capacity: usize,
    /// Cancel the whole run on the first reported stage error.
    pub cancel_on_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2,
            max_in_flight: num_cpus * 20,
            feed_capacity: 1,
            cancel_on_error: false,
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus,
            max_in_flight: num_cpus,
            feed_capacity: num_cpus,
            cancel_on_error: false,
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            workers: num_cpus * 2,
            max_in_flight: num_cpus * 20,
            feed_capacity: num_cpus * 2,
            cancel_on_error: false,
        }
    }
}


/// Runs `workers` sequential replicas of one processor over a shared input
/// and a shared output.
pub struct FixedPool<P: Payload> {
    replicas: Vec<Arc<Fifo<P>>>,
}

impl<P: Payload> FixedPool<P> {
    /// Returns `None` when `workers` is zero.
    pub fn new(processor: SharedProcessor<P>, workers: usize) -> Option<Self> {
        if workers == 0 {
            return None;
        }

        let replicas = (0..workers)
            .map(|_| Arc::new(Fifo::new(Arc::clone(&processor))))
            .collect();

        Some(Self { replicas })
    }

    pub fn with_config(processor: SharedProcessor<P>, config: &Config) -> Option<Self> {
        Self::new(processor, config.workers)
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.replicas.len()
    }
}

#[async_trait]
impl<P: Payload> Stage<P> for FixedPool<P> {
    async fn run(&self, cancel: &CancellationToken, params: StageParams<P>) {
        let mut replicas = ReplicaSet::new(params.position, params.errors.clone());
        for replica in &self.replicas {
            replicas.spawn_stage(replica, cancel, params.clone());
        }
        debug!(position = params.position, replicas = replicas.len(), "fixed pool started");
        drop(params);

        replicas.join().await;
    }
}


#[derive(Debug, Default)]
struct Counters {
    active_units: AtomicUsize,
    total_spawned: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    dropped_outputs: AtomicUsize,
}

/// Spawns one task per input item, with at most `max` of them alive at once.
///
/// Permits are taken from a semaphore holding exactly `max` of them. When all
/// are checked out the pool stops reading its input until a task finishes.
pub struct DynamicPool<P: Payload> {
    processor: SharedProcessor<P>,
    permits: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl<P: Payload> DynamicPool<P> {
    /// Returns `None` when `max` is zero.
    pub fn new(processor: SharedProcessor<P>, max: usize) -> Option<Self> {
        if max == 0 || max > Semaphore::MAX_PERMITS {
            return None;
        }

        Some(Self {
            processor,
            permits: Arc::new(Semaphore::new(max)),
            capacity: max,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn with_config(processor: SharedProcessor<P>, config: &Config) -> Option<Self> {
        Self::new(processor, config.max_in_flight)
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            capacity: self.capacity,
            available_permits: self.permits.available_permits(),
            active_units: self.counters.active_units.load(Ordering::Acquire),
            total_spawned: self.counters.total_spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped_outputs: self.counters.dropped_outputs.load(Ordering::Relaxed),
        }
    }

    fn spawn_unit(
        &self,
        units: &mut JoinSet<()>,
        cancel: &CancellationToken,
        params: &StageParams<P>,
        payload: P,
        permit: OwnedSemaphorePermit,
    ) {
        self.counters.total_spawned.fetch_add(1, Ordering::Relaxed);
        let active = ActiveUnit::enter(&self.counters);

        let unit = Unit {
            processor: Arc::clone(&self.processor),
            cancel: cancel.clone(),
            position: params.position,
            output: params.output.clone(),
            errors: params.errors.clone(),
            counters: Arc::clone(&self.counters),
        };
        units.spawn(unit.execute(payload, active, permit));
    }
}

#[async_trait]
impl<P: Payload> Stage<P> for DynamicPool<P> {
    /// Dropping the returned future aborts every unit still running.
    async fn run(&self, cancel: &CancellationToken, params: StageParams<P>) {
        debug!(position = params.position, capacity = self.capacity, "dynamic pool started");
        let mut units = JoinSet::new();

        while let Some(payload) = recv_or_cancel(cancel, &params.input).await {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            while units.try_join_next().is_some() {}
            self.spawn_unit(&mut units, cancel, &params, payload, permit);
        }

        // Every permit is back once the last unit has been joined.
        while units.join_next().await.is_some() {}
        trace!(available = self.permits.available_permits(), "permit pool drained");
        debug!(position = params.position, "dynamic pool stopped");
    }
}

/// Counts a unit as active for as long as it is alive, aborted or not.
struct ActiveUnit(Arc<Counters>);

impl ActiveUnit {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.active_units.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counters))
    }
}

impl Drop for ActiveUnit {
    fn drop(&mut self) {
        self.0.active_units.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Unit<P: Payload> {
    processor: SharedProcessor<P>,
    cancel: CancellationToken,
    position: usize,
    output: mpsc::Sender<P>,
    errors: ErrorSink,
    counters: Arc<Counters>,
}

impl<P: Payload> Unit<P> {
    /// The permit goes back only after this unit let go of its output sender.
    async fn execute(self, payload: P, active: ActiveUnit, permit: OwnedSemaphorePermit) {
        if let Err(panic) = AssertUnwindSafe(self.apply(payload)).catch_unwind().await {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(panic.as_ref());
            warn!(position = self.position, %message, "unit panicked");
            self.errors.append(StageError::panic(self.position, message));
        }

        drop(self);
        drop(active);
        drop(permit);
    }

    async fn apply(&self, payload: P) {
        match self.processor.process(&self.cancel, payload).await {
            Ok(Outcome::Emit(out)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if !send_or_cancel(&self.cancel, &self.output, out).await {
                    self.counters.dropped_outputs.fetch_add(1, Ordering::Relaxed);
                    trace!(position = self.position, "output dropped on shutdown");
                }
            }
            Ok(Outcome::Processed(done)) => {
                done.mark_as_processed();
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(position = self.position, error = %err, "transform failed");
                self.errors.append(StageError::transform(self.position, err));
            }
        }
    }
}
