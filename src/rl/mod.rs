//! Online Q-learning distilled into the function approximator.
pub mod action;
pub mod engine;
pub mod replay_buffer;
pub mod state;
pub mod value_store;
