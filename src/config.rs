//! Configuration for the learning engine.

use std::{path::PathBuf, time::Duration};

use crate::error::{BrainError, Result};
use crate::rl::action::Action;

/// Configuration for a [`crate::rl::engine::LearningEngine`].
///
/// The defaults reproduce the robot the engine was tuned on: a 10x10 grid,
/// 25 hidden units, alpha 0.2 and discount 0.99.
///
/// # Examples
///
/// ```
/// use qbrain::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_seed(44)
///     .with_data_dir("/tmp/qbrain")
///     .with_grid_size(4);
/// assert_eq!(config.input_size(), 16);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Side length of the square occupancy grid handed to `decide`.
    pub grid_size: usize,
    /// Width of the single hidden layer.
    pub hidden_size: usize,
    /// TD learning rate.
    pub learning_rate: f32,
    /// Weight of future rewards.
    pub discount: f32,
    /// Probability of taking a random action.
    pub exploration_rate: f32,
    /// Maximum number of transitions kept for replay.
    pub replay_capacity: usize,
    /// Fraction of the replay buffer resampled on every decision.
    pub replay_fraction: f32,
    /// Epochs per training call.
    pub training_epochs: usize,
    /// Sigmoid steepness used for training and evaluation.
    pub training_beta: f32,
    /// Sigmoid steepness of the serving generation before the first training call.
    pub initial_beta: f32,
    /// Probability of dropping a weight while propagating error backwards.
    pub dropout: f32,
    /// Retraining happens only while the last recorded error is above this.
    pub error_threshold: f32,
    /// Error assumed before anything has been evaluated.
    pub initial_error: f32,
    /// Cadence of the background loop.
    pub training_interval: Duration,
    /// Wall-clock time between persistence flushes.
    pub persist_interval: Duration,
    /// Directory holding the persisted tables and weights.
    pub data_dir: PathBuf,
    /// Seed for every random generator. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl EngineConfig {
    /// Set the side length of the input grid.
    #[must_use]
    pub fn with_grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Set the width of the hidden layer.
    #[must_use]
    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    /// Set the exploration rate.
    #[must_use]
    pub fn with_exploration_rate(mut self, rate: f32) -> Self {
        self.exploration_rate = rate;
        self
    }

    /// Set the cadence of the background loop.
    #[must_use]
    pub fn with_training_interval(mut self, interval: Duration) -> Self {
        self.training_interval = interval;
        self
    }

    /// Set the time between persistence flushes.
    #[must_use]
    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    /// Set the number of epochs per training call.
    #[must_use]
    pub fn with_training_epochs(mut self, epochs: usize) -> Self {
        self.training_epochs = epochs;
        self
    }

    /// Set the error above which the background loop keeps retraining.
    #[must_use]
    pub fn with_error_threshold(mut self, threshold: f32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the directory used for persisted state.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the random seed for deterministic behavior.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Length of a discretized state.
    #[must_use]
    pub fn input_size(&self) -> usize {
        self.grid_size * self.grid_size
    }

    /// Layer widths of the function approximator.
    #[must_use]
    pub fn structure(&self) -> Vec<usize> {
        vec![self.input_size(), self.hidden_size, Action::COUNT]
    }

    /// Check every field for values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let probabilities = [
            ("exploration_rate", self.exploration_rate),
            ("replay_fraction", self.replay_fraction),
            ("dropout", self.dropout),
            ("discount", self.discount),
            ("learning_rate", self.learning_rate),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(BrainError::InvalidArgument(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        let sizes = [
            ("grid_size", self.grid_size),
            ("hidden_size", self.hidden_size),
            ("replay_capacity", self.replay_capacity),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(BrainError::InvalidArgument(format!("{name} must be non-zero")));
            }
        }
        if self.training_interval.is_zero() || self.persist_interval.is_zero() {
            return Err(BrainError::InvalidArgument(
                "training and persistence intervals must be non-zero".to_string(),
            ));
        }
        if !self.training_beta.is_finite() || !self.initial_beta.is_finite() {
            return Err(BrainError::InvalidArgument("beta must be finite".to_string()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_size: 10,
            hidden_size: 25,
            learning_rate: 0.2,
            discount: 0.99,
            exploration_rate: 0.2,
            replay_capacity: 100,
            replay_fraction: 0.5,
            training_epochs: 100,
            training_beta: 0.01,
            initial_beta: 0.1,
            dropout: 0.1,
            error_threshold: 0.05,
            initial_error: 1.0,
            training_interval: Duration::from_secs(1),
            persist_interval: Duration::from_secs(30),
            data_dir: PathBuf::from("observations"),
            seed: None,
        }
    }
}
