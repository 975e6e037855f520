use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BrainError, Result};

/// Discretized environment snapshot: one bit per grid cell, row-major.
///
/// Used both as the key of the value tables and as the network input.
/// Serializes as a string of `0` and `1` characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct State(Vec<u8>);

impl State {
    /// The all-empty state of the given length.
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if any entry is not `0` or `1`.
    pub fn from_bits(bits: Vec<u8>) -> Result<Self> {
        if let Some(bad) = bits.iter().find(|&&b| b > 1) {
            return Err(BrainError::InvalidArgument(format!("state bits must be 0 or 1, got {bad}")));
        }
        Ok(Self(bits))
    }

    /// Flatten a sensed grid row by row and threshold every cell.
    ///
    /// Cells above `0.5` become `1`. Everything else becomes `0`, including
    /// readings outside `[0, 1]` and NaN.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if the grid does not hold
    /// exactly `expected_len` cells.
    pub fn discretize(grid: &[Vec<f32>], expected_len: usize) -> Result<Self> {
        let cells: usize = grid.iter().map(Vec::len).sum();
        if cells != expected_len {
            return Err(BrainError::InvalidArgument(format!(
                "expected a grid of {expected_len} cells, got {cells}"
            )));
        }
        Ok(Self(
            grid.iter()
                .flatten()
                .map(|&cell| u8::from(cell > 0.5))
                .collect(),
        ))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn bits(&self) -> &[u8] {
        &self.0
    }

    /// Network input for this state.
    #[must_use]
    pub fn to_input(&self) -> Vec<f32> {
        self.0.iter().map(|&b| f32::from(b)).collect()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b}")?;
        }
        Ok(())
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.to_string()
    }
}

impl TryFrom<String> for State {
    type Error = BrainError;

    fn try_from(encoded: String) -> Result<Self> {
        let bits = encoded
            .chars()
            .map(|c| match c {
                '0' => Ok(0),
                '1' => Ok(1),
                other => Err(BrainError::InvalidArgument(format!("invalid state character '{other}'"))),
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self(bits))
    }
}
