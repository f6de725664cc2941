//! Reduce-on-plateau learning-rate policy.

/// Multiplies the learning rate by `factor` once the monitored metric has not
/// improved by at least `min_delta` for `patience` consecutive updates.
/// Lower metric values are better.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    floor: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, floor: f64, min_delta: f64) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            floor,
            min_delta,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Best metric seen so far (`inf` before the first finite update).
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Record one metric value and return the learning rate to use next.
    pub fn step(&mut self, metric: f64) -> f64 {
        if metric.is_finite() && metric < self.best - self.min_delta {
            self.best = metric;
            self.wait = 0;
            return self.lr;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.lr > self.floor {
            let previous = self.lr;
            self.lr = (self.lr * self.factor).max(self.floor);
            self.wait = 0;
            tracing::info!(
                from = format!("{previous:.2e}"),
                to = format!("{:.2e}", self.lr),
                best = self.best,
                "Loss plateaued, reducing learning rate"
            );
        }
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_keeps_lr() {
        let mut sched = PlateauScheduler::new(0.01, 0.1, 2, 1e-8, 1e-4);
        for loss in [1.0, 0.9, 0.8, 0.7] {
            assert_eq!(sched.step(loss), 0.01);
        }
        assert_eq!(sched.best(), 0.7);
    }

    #[test]
    fn test_reduces_after_patience() {
        let mut sched = PlateauScheduler::new(0.01, 0.1, 3, 1e-8, 1e-4);
        sched.step(1.0);
        assert_eq!(sched.step(1.0), 0.01);
        assert_eq!(sched.step(1.0), 0.01);
        let lr = sched.step(1.0);
        assert!((lr - 1e-3).abs() < 1e-15, "expected 1e-3, got {lr}");

        // Wait counter restarts after a reduction.
        assert!((sched.step(1.0) - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_min_delta_required() {
        let mut sched = PlateauScheduler::new(0.01, 0.5, 1, 0.0, 0.1);
        sched.step(1.0);
        // 0.95 is not below 1.0 - 0.1.
        assert_eq!(sched.step(0.95), 0.005);
        assert_eq!(sched.best(), 1.0);
    }

    #[test]
    fn test_respects_floor() {
        let mut sched = PlateauScheduler::new(1e-3, 0.1, 1, 5e-5, 0.0);
        sched.step(1.0);
        let mut lr = 0.0;
        for _ in 0..10 {
            lr = sched.step(1.0);
        }
        assert_eq!(lr, 5e-5);
    }

    #[test]
    fn test_non_finite_is_not_improvement() {
        let mut sched = PlateauScheduler::new(0.01, 0.1, 2, 1e-8, 0.0);
        sched.step(f64::NAN);
        sched.step(f64::NEG_INFINITY);
        assert!(sched.best().is_infinite() && sched.best() > 0.0);
        assert!(sched.lr() < 0.01);
    }
}
