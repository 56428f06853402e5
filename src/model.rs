/// Unit of data flowing through a pipeline.
///
/// Items move between stages by value. A stage that hands one item to several
/// branches gives the original to a single branch and a [`Clone`] to every other,
/// so each branch owns its copy outright.
pub trait Payload: Clone + Send + 'static {
    /// Called when the item reaches a terminal point and nothing is emitted for it.
    fn mark_as_processed(self) {}
}

/// What a transform did with its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<P> {
    /// Forward the item to the next stage.
    Emit(P),
    /// Nothing goes downstream; the stage marks the returned input as processed.
    Processed(P),
}

impl<P> Outcome<P> {
    pub fn into_inner(self) -> P {
        match self {
            Outcome::Emit(p) | Outcome::Processed(p) => p,
        }
    }

    pub fn is_emit(&self) -> bool {
        matches!(self, Outcome::Emit(_))
    }
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub capacity: usize,
    pub available_permits: usize,
    pub active_units: usize,
    pub total_spawned: usize,
    pub completed: usize,
    pub failed: usize,
    pub dropped_outputs: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.active_units as f64 / self.capacity as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            return 1.0;
        }
        self.completed as f64 / total as f64
    }

    /// True once every spawned unit finished and all permits are back.
    pub fn is_idle(&self) -> bool {
        self.active_units == 0 && self.available_permits == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_ratios() {
        let m = PoolMetrics {
            capacity: 4,
            available_permits: 3,
            active_units: 1,
            total_spawned: 10,
            completed: 8,
            failed: 2,
            dropped_outputs: 0,
        };
        assert_eq!(m.utilization(), 0.25);
        assert_eq!(m.success_rate(), 0.8);
        assert!(!m.is_idle());
    }

    #[test]
    fn outcome_unwraps_either_variant() {
        assert!(Outcome::Emit(1).is_emit());
        assert_eq!(Outcome::Processed(7).into_inner(), 7);
    }
}
