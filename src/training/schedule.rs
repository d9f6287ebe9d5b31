//! Learning rate schedules

/// Step decay: `initial_lr * decay_factor ^ floor(epoch / step_size)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecay {
    pub initial_lr: f64,
    pub decay_factor: f64,
    pub step_size: usize,
}

impl StepDecay {
    /// A `step_size` of zero is treated as one
    pub fn new(initial_lr: f64, decay_factor: f64, step_size: usize) -> Self {
        Self {
            initial_lr,
            decay_factor,
            step_size: step_size.max(1),
        }
    }

    /// Learning rate for a zero-based epoch index
    pub fn learning_rate(&self, epoch: usize) -> f64 {
        let steps = (epoch / self.step_size) as i32;
        self.initial_lr * self.decay_factor.powi(steps)
    }
}

/// Step decay schedule used by the autoencoder trainer
pub fn step_decay_schedule(initial_lr: f64, decay_factor: f64, step_size: usize) -> StepDecay {
    StepDecay::new(initial_lr, decay_factor, step_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_decay() {
        let schedule = step_decay_schedule(0.0005, 1.0, 1);
        assert_eq!(schedule.learning_rate(0), 0.0005);
        assert_eq!(schedule.learning_rate(50), 0.0005);
    }

    #[test]
    fn test_decay_per_step() {
        let schedule = step_decay_schedule(1.0, 0.5, 2);
        assert_eq!(schedule.learning_rate(0), 1.0);
        assert_eq!(schedule.learning_rate(1), 1.0);
        assert_eq!(schedule.learning_rate(2), 0.5);
        assert_eq!(schedule.learning_rate(5), 0.25);
    }

    #[test]
    fn test_zero_step_size() {
        let schedule = StepDecay::new(1.0, 0.1, 0);
        assert_eq!(schedule.step_size, 1);
        assert!((schedule.learning_rate(2) - 0.01).abs() < 1e-12);
    }
}
