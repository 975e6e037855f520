//! Numerical model code: weight matrices, activation, error and the network.
pub mod linear;
pub mod mlp;
pub mod mse;
pub mod sigmoid;
