//! Bounded window of recent transitions, replayed on every decision.
use std::collections::VecDeque;

use rand::Rng;

use crate::rl::{action::Action, state::State};

/// A single observed step: acting in `state` led to `next_state` and `reward`.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// The state observed before taking an action.
    pub state: State,
    /// The action credited for this step.
    pub action: Action,
    /// Score change reported by the caller.
    pub reward: f32,
    /// The state observed after taking the action.
    pub next_state: State,
}

/// A fixed-capacity replay buffer.
///
/// Older transitions are removed once the buffer reaches its maximum size.
#[derive(Debug)]
pub struct ReplayBuffer {
    /// Maximum capacity of the buffer.
    capacity: usize,
    /// The backing buffer array.
    buffer: VecDeque<Transition>,
}

impl ReplayBuffer {
    /// Create a new replay buffer with the given maximum capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert a new transition, removing the oldest if capacity is exceeded.
    pub fn push(&mut self, transition: Transition) {
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(transition);
    }

    /// Draw `count` transitions uniformly at random, with replacement.
    ///
    /// Returns nothing if the buffer is empty.
    pub fn sample<R: Rng>(&self, count: usize, rng: &mut R) -> Vec<Transition> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| self.buffer[rng.gen_range(0..self.buffer.len())].clone())
            .collect()
    }

    /// Length of the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn transition(reward: f32) -> Transition {
        Transition {
            state: State::zeros(4),
            action: Action::Forward,
            reward,
            next_state: State::zeros(4),
        }
    }

    #[test]
    fn test_buffer_evicts_oldest_past_capacity() {
        let mut buffer = ReplayBuffer::new(100);
        for i in 0..150 {
            buffer.push(transition(i as f32));
            assert!(buffer.len() <= 100);
        }
        assert_eq!(buffer.len(), 100);
        let rewards: Vec<f32> = buffer.buffer.iter().map(|t| t.reward).collect();
        assert_eq!(rewards.first(), Some(&50.0));
        assert_eq!(rewards.last(), Some(&149.0));
        assert!(!rewards.contains(&0.0));
        assert!(!rewards.contains(&49.0));
    }

    #[test]
    fn test_sample_draws_with_replacement() {
        let mut buffer = ReplayBuffer::new(100);
        buffer.push(transition(1.0));
        buffer.push(transition(2.0));
        let mut rng = StdRng::seed_from_u64(3);

        // more draws than entries is fine
        let drawn = buffer.sample(10, &mut rng);
        assert_eq!(drawn.len(), 10);
        assert!(drawn.iter().all(|t| t.reward == 1.0 || t.reward == 2.0));
    }

    #[test]
    fn test_sample_of_empty_buffer() {
        let buffer = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(buffer.sample(5, &mut rng).is_empty());
        assert!(buffer.is_empty());
    }
}
