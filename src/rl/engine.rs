//! The learning engine serves decisions on the caller's thread and retrains
//! the network on a background task.
//!
//! Decision path: discretize, act epsilon-greedily, record the transition,
//! replay half the buffer through the value store, then apply the TD update
//! for the step just taken.
//!
//! Background path: every `training_interval`, retrain on the whole training
//! universe while the last recorded error is above `error_threshold`, record
//! the new error, and flush to disk every `persist_interval`.
//!
//! Each recorded error is a fresh mean over the current batch. It is not
//! accumulated on top of the previous iteration's error, so the history is
//! not a running total and stays comparable between iterations.
use std::{
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::config::EngineConfig;
use crate::deep::{
    mlp::{expected_shapes, shape_key, Mlp},
    mse::mean_squared_error,
};
use crate::error::{BrainError, Result};
use crate::locks::{lock, read, write};
use crate::persistence;
use crate::rl::{
    action::Action,
    replay_buffer::{ReplayBuffer, Transition},
    state::State,
    value_store::{ActionValues, ValueStore},
};

/// Outcome of one call to [`LearningEngine::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// `true` when the action was drawn at random instead of predicted.
    pub exploratory: bool,
}

impl Decision {
    /// One-hot motor command.
    #[must_use]
    pub fn one_hot(self) -> [u8; Action::COUNT] {
        self.action.one_hot()
    }
}

/// Bookkeeping owned by the decision path.
#[derive(Debug)]
struct DecisionState {
    rng: StdRng,
    replay: ReplayBuffer,
    previous_score: f32,
    previous_state: State,
    previous_action: Action,
}

/// Everything the decision path and the background loop both touch.
#[derive(Debug)]
struct Shared {
    config: EngineConfig,
    /// Value tables and training universe. Each lock covers one table operation.
    store: RwLock<ValueStore>,
    network: Mlp,
    errors: Mutex<Vec<f32>>,
    /// Shuffles the training universe. Only the background loop draws from it.
    sampler: Mutex<StdRng>,
    /// Held for a whole flush. Flushes share their `.tmp` file names.
    persist_lock: Mutex<()>,
}

/// Online Q-learner distilled into a continuously retrained network.
#[derive(Debug)]
pub struct LearningEngine {
    shared: Arc<Shared>,
    decision: Mutex<DecisionState>,
    kill_sender: UnboundedSender<()>,
    handle: JoinHandle<()>,
}

impl LearningEngine {
    /// Load persisted state from `config.data_dir` if present and start the
    /// background training loop on the current tokio runtime.
    ///
    /// Missing or unreadable files are logged and replaced by fresh state.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] for an invalid configuration
    /// and [`BrainError::NoRuntime`] when called outside a tokio runtime.
    pub fn start(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| BrainError::NoRuntime)?;

        let mut store = load_value_store(&config, seeded(config.seed, 0));
        let network = load_network(&config, seeded(config.seed, 1))?;

        let bootstrap = State::zeros(config.input_size());
        store.get_or_init(&bootstrap);
        store.register(&bootstrap);

        let decision = DecisionState {
            rng: seeded(config.seed, 2),
            replay: ReplayBuffer::new(config.replay_capacity),
            previous_score: 0.0,
            previous_state: bootstrap,
            previous_action: Action::Forward,
        };

        let shared = Arc::new(Shared {
            store: RwLock::new(store),
            network,
            errors: Mutex::new(Vec::new()),
            sampler: Mutex::new(seeded(config.seed, 3)),
            persist_lock: Mutex::new(()),
            config,
        });

        let (kill_sender, kill_receiver) = mpsc::unbounded_channel::<()>();
        let handle = runtime.spawn(background_loop(Arc::clone(&shared), kill_receiver));

        Ok(Self {
            shared,
            decision: Mutex::new(decision),
            kill_sender,
            handle,
        })
    }

    /// Choose an action for the sensed `grid` and learn from the score change
    /// since the previous call.
    ///
    /// With probability `exploration_rate` the action is random and only the
    /// discretized state is recorded. Otherwise the serving network picks the
    /// action and the value store is updated from the resulting transition.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if the grid does not hold
    /// `grid_size * grid_size` cells.
    pub fn decide(&self, score: f32, grid: &[Vec<f32>]) -> Result<Decision> {
        let config = &self.shared.config;
        let state = State::discretize(grid, config.input_size())?;
        let mut decision = lock(&self.decision);

        if decision.rng.gen::<f32>() < config.exploration_rate {
            let action = Action::random(&mut decision.rng);
            let mut store = write(&self.shared.store);
            store.get_or_init(&state);
            store.register(&state);
            return Ok(Decision {
                action,
                exploratory: true,
            });
        }

        let predicted = self.shared.network.forward_one(&state.to_input())?;
        let action = Action::greedy(&predicted);
        let reward = score - decision.previous_score;

        let DecisionState {
            rng,
            replay,
            previous_state,
            ..
        } = &mut *decision;

        replay.push(Transition {
            state: previous_state.clone(),
            action,
            reward,
            next_state: state.clone(),
        });

        // a single TD update only carries reward back one step, so replay
        // recent transitions to propagate it further
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let replay_count = (replay.len() as f32 * config.replay_fraction).floor() as usize;
        for t in replay.sample(replay_count, rng) {
            write(&self.shared.store).update(&t.state, t.action, t.reward, &t.next_state);
        }

        {
            let mut store = write(&self.shared.store);
            store.update(previous_state, action, reward, &state);
            store.register(&state);
        }

        debug!("Predicted {predicted:?}, chose {action:?} with reward {reward}");
        decision.previous_score = score;
        decision.previous_state = state;
        decision.previous_action = action;

        Ok(Decision {
            action,
            exploratory: false,
        })
    }

    /// Serving network output for `state`.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if `state` has the wrong length.
    pub fn predict(&self, state: &State) -> Result<Vec<f32>> {
        self.shared.network.forward_one(&state.to_input())
    }

    #[must_use]
    pub fn action_values(&self, state: &State) -> Option<ActionValues> {
        read(&self.shared.store).action_values(state)
    }

    #[must_use]
    pub fn target(&self, state: &State) -> Option<ActionValues> {
        read(&self.shared.store).target(state)
    }

    /// Copy of every state the network is trained on, in registration order.
    #[must_use]
    pub fn training_universe(&self) -> Vec<State> {
        read(&self.shared.store).all_states().to_vec()
    }

    /// Every approximation error recorded by the background loop, oldest first.
    #[must_use]
    pub fn error_history(&self) -> Vec<f32> {
        lock(&self.shared.errors).clone()
    }

    /// Action taken on the last greedy decision.
    #[must_use]
    pub fn previous_action(&self) -> Action {
        lock(&self.decision).previous_action
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Write the value tables, universe and weights to disk now.
    ///
    /// The weights written are the last published generation, so an
    /// in-flight training call is not waited for. A flush already running
    /// on the background loop is waited for.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn persist(&self) -> Result<()> {
        self.shared.persist()
    }

    /// Ask the background loop to stop after its current iteration.
    ///
    /// A loop waiting for its next iteration stops right away.
    pub fn signal_shutdown(&self) {
        if self.kill_sender.send(()).is_err() {
            debug!("Background loop already stopped");
        }
    }

    /// Stop the background loop and wait for its final flush.
    ///
    /// An in-flight training call is allowed to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::BackgroundTask`] if the loop panicked or was cancelled.
    pub async fn shutdown(self) -> Result<()> {
        self.signal_shutdown();
        let Self { handle, .. } = self;
        handle
            .await
            .map_err(|e| BrainError::BackgroundTask(e.to_string()))
    }
}

impl Shared {
    /// One pass of the background loop. Returns the new error, if one was recorded.
    fn training_iteration(&self, last_error: f32) -> Option<f32> {
        let config = &self.config;
        let batch = {
            let store = read(&self.store);
            let mut sampler = lock(&self.sampler);
            store.training_batch(&mut *sampler)
        };
        let (inputs, targets) = match batch {
            Ok(batch) if batch.0.is_empty() => return None,
            Ok(batch) => batch,
            Err(e) => {
                error!("Skipping training iteration: {e}");
                return None;
            }
        };

        if last_error > config.error_threshold {
            if let Err(e) = self.network.train(
                &inputs,
                &targets,
                config.training_epochs,
                config.training_beta,
                config.dropout,
            ) {
                error!("Training failed: {e}");
                return None;
            }
        }

        let activations = match self.network.forward_batch(&inputs, config.training_beta) {
            Ok(activations) => activations,
            Err(e) => {
                error!("Evaluation failed: {e}");
                return None;
            }
        };
        let predictions = activations.last()?;
        let error = mean_squared_error(predictions, &targets);
        debug!("Error: {error} over {} states", targets.len());
        lock(&self.errors).push(error);
        Some(error)
    }

    fn persist(&self) -> Result<()> {
        let _flushing = lock(&self.persist_lock);
        let dir = &self.config.data_dir;
        let snapshot = read(&self.store).snapshot();
        persistence::save_store(dir, &snapshot)?;
        let weights = persistence::save_weights(dir, &self.network.snapshot())?;
        info!(
            "Saved {} states and weights {:?}",
            snapshot.universe.len(),
            weights
        );
        Ok(())
    }
}

async fn background_loop(shared: Arc<Shared>, mut kill_receiver: UnboundedReceiver<()>) {
    info!("Background training loop started");
    let mut last_error = shared.config.initial_error;
    let mut last_flush = Instant::now();

    loop {
        // a dropped engine closes the channel, which stops the loop too
        tokio::select! {
            () = tokio::time::sleep(shared.config.training_interval) => (),
            _ = kill_receiver.recv() => break,
        }

        let worker = Arc::clone(&shared);
        match tokio::task::spawn_blocking(move || worker.training_iteration(last_error)).await {
            Ok(Some(error)) => last_error = error,
            Ok(None) => (),
            Err(e) => error!("Training iteration did not complete: {e}"),
        }

        if last_flush.elapsed() >= shared.config.persist_interval {
            flush(&shared).await;
            last_flush = Instant::now();
        }
    }

    flush(&shared).await;
    info!("Background training loop stopped");
}

async fn flush(shared: &Arc<Shared>) {
    let worker = Arc::clone(shared);
    match tokio::task::spawn_blocking(move || worker.persist()).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => error!("Could not persist learned state: {e}"),
        Err(e) => error!("Persistence task did not complete: {e}"),
    }
}

/// Independent generator per component, reproducible when a seed is set.
fn seeded(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

fn load_value_store(config: &EngineConfig, rng: StdRng) -> ValueStore {
    let dir = &config.data_dir;
    match persistence::load_store(dir) {
        Ok(Some(snapshot)) => {
            info!("Loaded {} states from {:?}", snapshot.universe.len(), dir);
            ValueStore::from_snapshot(snapshot, config.learning_rate, config.discount, rng)
        }
        Ok(None) => {
            info!("No saved value tables in {dir:?}. Starting fresh");
            ValueStore::new(config.learning_rate, config.discount, rng)
        }
        Err(e) => {
            warn!("Could not load value tables from {dir:?}: {e}. Starting fresh");
            ValueStore::new(config.learning_rate, config.discount, rng)
        }
    }
}

fn load_network(config: &EngineConfig, rng: StdRng) -> Result<Mlp> {
    let structure = config.structure();
    let shapes = expected_shapes(&structure);
    let saved = match persistence::load_weights(&config.data_dir, &shapes) {
        Ok(saved) => saved,
        Err(e) => {
            warn!("Could not load weights {}: {e}", shape_key(&shapes));
            None
        }
    };

    if let Some(snapshot) = saved {
        match Mlp::from_snapshot(structure.clone(), snapshot, rng.clone()) {
            Ok(network) => {
                info!("Loaded weights {}", shape_key(&shapes));
                return Ok(network);
            }
            Err(e) => warn!("Ignoring saved weights: {e}"),
        }
    } else {
        info!("No saved weights {}. Starting fresh", shape_key(&shapes));
    }
    Mlp::new(structure, config.initial_beta, rng)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::default()
            .with_seed(44)
            .with_data_dir(dir)
            .with_training_interval(Duration::from_secs(3600))
            .with_persist_interval(Duration::from_secs(3600))
    }

    fn random_grid(rng: &mut StdRng, side: usize) -> Vec<Vec<f32>> {
        (0..side)
            .map(|_| (0..side).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_decision_on_empty_grid() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let engine = LearningEngine::start(config(dir.path())).unwrap();
        assert_eq!(engine.training_universe(), vec![State::zeros(100)]);

        let decision = engine.decide(0.0, &vec![vec![0.0; 10]; 10]).unwrap();
        let encoded = decision.one_hot();
        assert_eq!(encoded.len(), 5);
        assert_eq!(encoded.iter().filter(|&&x| x == 1).count(), 1);

        // the decided state is the bootstrap state
        assert_eq!(engine.training_universe(), vec![State::zeros(100)]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wrong_grid_size_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = LearningEngine::start(config(dir.path())).unwrap();
        let result = engine.decide(0.0, &vec![vec![0.0; 9]; 10]);
        assert!(matches!(result, Err(BrainError::InvalidArgument(_))));
        engine.shutdown().await.unwrap();
    }

    #[test]
    fn start_outside_runtime_fails() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            LearningEngine::start(config(dir.path())),
            Err(BrainError::NoRuntime)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exploration_rate_is_respected() {
        let dir = tempdir().unwrap();
        let engine = LearningEngine::start(config(dir.path())).unwrap();
        let grid = vec![vec![1.0; 10]; 10];

        let n = 4000;
        let mut exploratory = 0;
        let mut greedy_actions = Vec::new();
        for step in 0..n {
            let decision = engine.decide(step as f32, &grid).unwrap();
            if decision.exploratory {
                exploratory += 1;
            } else {
                greedy_actions.push(decision.action);
            }
        }

        let fraction = f64::from(exploratory) / f64::from(n);
        assert!((fraction - 0.2).abs() < 0.03, "random fraction was {fraction}");

        // nothing retrains the network here, so the greedy choice never changes
        assert!(greedy_actions.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(engine.previous_action(), greedy_actions[greedy_actions.len() - 1]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn greedy_decisions_update_values_and_universe() {
        let dir = tempdir().unwrap();
        let engine = LearningEngine::start(config(dir.path()).with_exploration_rate(0.0)).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let mut seen = vec![State::zeros(100)];
        for step in 0..20 {
            let grid = random_grid(&mut rng, 10);
            seen.push(State::discretize(&grid, 100).unwrap());
            let decision = engine.decide(step as f32, &grid).unwrap();
            assert!(!decision.exploratory);
        }

        let universe = engine.training_universe();
        assert_eq!(universe.len(), seen.len());
        for state in &universe {
            assert!(engine.action_values(state).is_some());
            let target = engine.target(state).unwrap();
            assert!(target.iter().all(|t| (0.0..=1.0).contains(t)));
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persisted_state_reloads_identically() {
        let dir = tempdir().unwrap();
        let first = LearningEngine::start(config(dir.path())).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        for step in 0..30 {
            first.decide(step as f32, &random_grid(&mut rng, 10)).unwrap();
        }
        first.persist().unwrap();

        let second = LearningEngine::start(config(dir.path()).with_seed(7)).unwrap();
        let universe = first.training_universe();
        assert_eq!(second.training_universe(), universe);
        for state in &universe {
            assert_eq!(second.action_values(state), first.action_values(state));
            assert_eq!(second.target(state), first.target(state));
            assert_eq!(second.predict(state).unwrap(), first.predict(state).unwrap());
        }

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_files_fall_back_to_fresh_state() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(persistence::VALUES_FILE), "garbage").unwrap();
        std::fs::write(dir.path().join("weights_101x25_26x5.json"), "[1, 2").unwrap();

        let engine = LearningEngine::start(config(dir.path())).unwrap();
        assert_eq!(engine.training_universe().len(), 1);
        assert_eq!(engine.predict(&State::zeros(100)).unwrap().len(), 5);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_loop_trains_and_flushes_on_shutdown() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let config = config(dir.path())
            .with_grid_size(4)
            .with_hidden_size(6)
            .with_training_epochs(10)
            .with_training_interval(Duration::from_millis(10));
        let engine = LearningEngine::start(config).unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        for step in 0..10 {
            engine.decide(step as f32, &random_grid(&mut rng, 4)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.error_history().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let history = engine.error_history();
        assert!(!history.is_empty());
        assert!(history.iter().all(|e| e.is_finite() && *e >= 0.0));

        engine.shutdown().await.unwrap();
        assert!(dir.path().join(persistence::VALUES_FILE).exists());
        assert!(dir.path().join(persistence::UNIVERSE_FILE).exists());
        assert!(dir.path().join("weights_17x6_7x5.json").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn training_skipped_below_threshold() {
        let dir = tempdir().unwrap();
        let config = config(dir.path())
            .with_grid_size(4)
            .with_hidden_size(6)
            .with_training_epochs(10)
            .with_error_threshold(100.0)
            .with_training_interval(Duration::from_millis(10));
        let engine = LearningEngine::start(config).unwrap();

        let mut rng = StdRng::seed_from_u64(13);
        for step in 0..10 {
            engine.decide(step as f32, &random_grid(&mut rng, 4)).unwrap();
        }
        let empty = State::zeros(16);
        let before = engine.predict(&empty).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.error_history().len() < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // errors keep being recorded, but none is above the threshold
        assert!(engine.error_history().len() >= 3);
        assert_eq!(engine.predict(&empty).unwrap(), before);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_flush_writes_files() {
        let dir = tempdir().unwrap();
        let config = config(dir.path())
            .with_grid_size(4)
            .with_hidden_size(6)
            .with_training_epochs(5)
            .with_training_interval(Duration::from_millis(10))
            .with_persist_interval(Duration::from_millis(20));
        let engine = LearningEngine::start(config).unwrap();
        engine.decide(1.0, &vec![vec![1.0; 4]; 4]).unwrap();

        let weights = dir.path().join("weights_17x6_7x5.json");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !weights.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(weights.exists());
        assert!(dir.path().join(persistence::VALUES_FILE).exists());
        assert!(dir.path().join(persistence::TARGETS_FILE).exists());
        assert!(dir.path().join(persistence::UNIVERSE_FILE).exists());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn persist_alongside_background_flushes() {
        let dir = tempdir().unwrap();
        let config = config(dir.path())
            .with_grid_size(4)
            .with_hidden_size(6)
            .with_training_epochs(5)
            .with_training_interval(Duration::from_millis(1))
            .with_persist_interval(Duration::from_millis(1));
        let engine = LearningEngine::start(config.clone()).unwrap();

        let mut rng = StdRng::seed_from_u64(17);
        for step in 0..10 {
            engine.decide(step as f32, &random_grid(&mut rng, 4)).unwrap();
        }

        let mut failures = Vec::new();
        for _ in 0..500 {
            if let Err(e) = engine.persist() {
                failures.push(e.to_string());
            }
            tokio::task::yield_now().await;
        }
        assert!(failures.is_empty(), "{} flushes failed, first: {:?}", failures.len(), failures.first());

        let universe = engine.training_universe();
        engine.shutdown().await.unwrap();

        // whatever was left on disk is complete and loads back
        let reloaded = LearningEngine::start(config).unwrap();
        assert_eq!(reloaded.training_universe(), universe);
        reloaded.shutdown().await.unwrap();
    }
}
