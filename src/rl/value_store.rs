//! Tabular action-value estimates and the normalized targets the network is
//! trained towards.
//!
//! The store grows with every state the robot observes and never evicts.
//! Memory is bounded only by the number of distinct discretized states the
//! environment produces.
use std::collections::{HashMap, HashSet};

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{BrainError, Result};
use crate::rl::{action::Action, state::State};

/// One estimate per action, index-aligned with [`Action::VARIANTS`].
pub type ActionValues = [f32; Action::COUNT];

/// Rescale `values` into `[0, 1]` by their own minimum and maximum.
///
/// Returns `None` when every entry is equal, since there is no range to
/// rescale by.
#[must_use]
pub fn min_max_normalize(values: &ActionValues) -> Option<ActionValues> {
    let worst = values.iter().copied().fold(f32::INFINITY, f32::min);
    let best = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = best - worst;
    if range == 0.0 || !range.is_finite() {
        return None;
    }
    Some(values.map(|v| (v - worst) / range))
}

/// Everything the store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub values: HashMap<State, ActionValues>,
    pub targets: HashMap<State, ActionValues>,
    pub universe: Vec<State>,
}

/// Q-table keyed by discretized state, plus the training universe.
#[derive(Debug)]
pub struct ValueStore {
    values: HashMap<State, ActionValues>,
    targets: HashMap<State, ActionValues>,
    /// Every registered state, in registration order.
    universe: Vec<State>,
    known: HashSet<State>,
    /// TD learning rate.
    learning_rate: f32,
    /// Weight decay for future rewards.
    discount: f32,
    rng: StdRng,
}

impl ValueStore {
    #[must_use]
    pub fn new(learning_rate: f32, discount: f32, rng: StdRng) -> Self {
        Self::from_snapshot(StoreSnapshot::default(), learning_rate, discount, rng)
    }

    /// Rebuild a store from persisted tables. Duplicate universe entries are dropped.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot, learning_rate: f32, discount: f32, rng: StdRng) -> Self {
        let mut store = Self {
            values: snapshot.values,
            targets: snapshot.targets,
            universe: Vec::with_capacity(snapshot.universe.len()),
            known: HashSet::with_capacity(snapshot.universe.len()),
            learning_rate,
            discount,
            rng,
        };
        for state in snapshot.universe {
            store.register(&state);
        }
        store
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            values: self.values.clone(),
            targets: self.targets.clone(),
            universe: self.universe.clone(),
        }
    }

    /// Estimates for `state`, creating them if the state is new.
    ///
    /// A new state gets a single uniform `[0, 1)` draw repeated across all
    /// actions, and its target is a copy of those estimates.
    pub fn get_or_init(&mut self, state: &State) -> ActionValues {
        if let Some(values) = self.values.get(state) {
            return *values;
        }
        let initial = [self.rng.gen::<f32>(); Action::COUNT];
        self.values.insert(state.clone(), initial);
        self.targets
            .insert(state.clone(), min_max_normalize(&initial).unwrap_or(initial));
        initial
    }

    /// Apply the TD(0) rule to `prior` for `action`, then refresh its target.
    ///
    /// `Q(s,a) += alpha * (r + discount * max_a' Q(s',a') - Q(s,a))`
    ///
    /// When the updated estimates have no range the previous target is
    /// kept, or all zeros if `prior` never had one.
    pub fn update(&mut self, prior: &State, action: Action, reward: f32, next: &State) {
        let best_next = self
            .get_or_init(next)
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let mut values = self.get_or_init(prior);

        let a = action.index();
        values[a] += self.learning_rate * (reward + self.discount * best_next - values[a]);
        self.values.insert(prior.clone(), values);

        if let Some(target) = min_max_normalize(&values) {
            self.targets.insert(prior.clone(), target);
        } else {
            self.targets.entry(prior.clone()).or_insert([0.0; Action::COUNT]);
        }
    }

    /// Add `state` to the training universe. Returns `false` if already present.
    pub fn register(&mut self, state: &State) -> bool {
        if !self.known.insert(state.clone()) {
            return false;
        }
        self.universe.push(state.clone());
        true
    }

    /// The training universe, in registration order.
    #[must_use]
    pub fn all_states(&self) -> &[State] {
        &self.universe
    }

    #[must_use]
    pub fn action_values(&self, state: &State) -> Option<ActionValues> {
        self.values.get(state).copied()
    }

    #[must_use]
    pub fn target(&self, state: &State) -> Option<ActionValues> {
        self.targets.get(state).copied()
    }

    /// The whole universe in random order, as network inputs and targets.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InconsistentUniverse`] if a registered state has
    /// no target.
    pub fn training_batch<R: Rng>(&self, rng: &mut R) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>)> {
        let mut order: Vec<&State> = self.universe.iter().collect();
        order.shuffle(rng);

        let mut inputs = Vec::with_capacity(order.len());
        let mut targets = Vec::with_capacity(order.len());
        for state in order {
            let target = self
                .targets
                .get(state)
                .ok_or_else(|| BrainError::InconsistentUniverse(state.to_string()))?;
            inputs.push(state.to_input());
            targets.push(target.to_vec());
        }
        Ok((inputs, targets))
    }
}
