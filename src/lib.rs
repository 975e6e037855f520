#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(unsafe_code)]

pub mod config;
pub mod deep;
pub mod error;
mod locks;
pub mod persistence;
pub mod rl;

pub use config::EngineConfig;
pub use error::{BrainError, Result};
pub use rl::{
    action::Action,
    engine::{Decision, LearningEngine},
    state::State,
};
