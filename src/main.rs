use std::time::Duration;

use log::{debug, error, info};
use qbrain::{Action, EngineConfig, LearningEngine};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Control cycles to run when no count is given on the command line.
const DEFAULT_CYCLES: usize = 200;
const CYCLE: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "qbrain=debug");
    }
    env_logger::init();

    let cycles = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_CYCLES);

    let engine = match LearningEngine::start(EngineConfig::default().with_seed(44)) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Could not start the learning engine: {e}");
            return;
        }
    };

    let side = engine.config().grid_size;

    // stand-in for the sensor loop: obstacles drift at random and moving
    // forward into a free cell scores a point
    let mut rng = StdRng::seed_from_u64(7);
    let mut grid: Vec<Vec<f32>> = vec![vec![0.5; side]; side];
    let mut score = 0.0;
    for cycle in 0..cycles {
        let (row, col) = (rng.gen_range(0..side), rng.gen_range(0..side));
        grid[row][col] = rng.gen();

        let decision = match engine.decide(score, &grid) {
            Ok(decision) => decision,
            Err(e) => {
                error!("Decision failed: {e}");
                break;
            }
        };
        let ahead = grid[side / 2 - 1][side / 2];
        if decision.action == Action::Forward && ahead <= 0.5 {
            score += 1.0;
        }
        debug!("Cycle {cycle}: {:?} score {score}", decision.one_hot());
        tokio::time::sleep(CYCLE).await;
    }

    let history = engine.error_history();
    info!(
        "Ran {cycles} cycles, final score {score}, {} errors recorded, last {:?}",
        history.len(),
        history.last()
    );
    if let Err(e) = engine.shutdown().await {
        error!("Shutdown failed: {e}");
    }
}
