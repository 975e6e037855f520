//! Feed-forward sigmoid network that keeps two generations of weights.
//!
//! The canonical generation is only touched by [`Mlp::train`]. The serving
//! generation is a published copy that [`Mlp::forward_one`] reads, so a
//! decision never waits on a multi-epoch training pass.
use std::sync::Mutex;

use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

use crate::deep::linear::{self, Matrix};
use crate::deep::sigmoid::{activate, slope};
use crate::error::{BrainError, Result};
use crate::locks::lock;

/// Step size every weight starts a training call with.
const INITIAL_RATE: f32 = 0.01;
/// Step size multiplier when a gradient keeps its sign between epochs.
const RATE_GROWTH: f32 = 1.1;
/// Step size multiplier when a gradient flips sign between epochs.
const RATE_DECAY: f32 = 0.9;
/// Initial weights are drawn from `[-INIT_LIMIT, INIT_LIMIT)`.
const INIT_LIMIT: f32 = 0.5;

/// A complete set of weights together with the steepness they are meant to
/// be evaluated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsSnapshot {
    pub beta: f32,
    pub layers: Vec<Matrix>,
}

impl WeightsSnapshot {
    /// Shape of every bias-augmented matrix, in layer order.
    #[must_use]
    pub fn shapes(&self) -> Vec<(usize, usize)> {
        self.layers.iter().map(|m| linear::shape(m)).collect()
    }
}

/// Key identifying a network topology, e.g. `101x25_26x5`.
#[must_use]
pub fn shape_key(shapes: &[(usize, usize)]) -> String {
    shapes
        .iter()
        .map(|(rows, cols)| format!("{rows}x{cols}"))
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug)]
struct Canonical {
    weights: Vec<Matrix>,
    rng: StdRng,
}

/// Multi-layer perceptron with sigmoid activations on every layer.
#[derive(Debug)]
pub struct Mlp {
    structure: Vec<usize>,
    canonical: Mutex<Canonical>,
    serving: Mutex<WeightsSnapshot>,
}

impl Mlp {
    /// Create a network with uniformly random weights.
    ///
    /// The serving generation starts as a copy of the canonical weights,
    /// evaluated with `beta` until the first training call publishes.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if `structure` has fewer than
    /// two layers or a zero-width layer.
    pub fn new(structure: Vec<usize>, beta: f32, mut rng: StdRng) -> Result<Self> {
        check_structure(&structure)?;
        let weights: Vec<Matrix> = structure
            .windows(2)
            .map(|pair| linear::init_uniform(pair[0], pair[1], INIT_LIMIT, &mut rng))
            .collect();
        Ok(Self::assemble(structure, WeightsSnapshot { beta, layers: weights }, rng))
    }

    /// Create a network from previously saved weights.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if the snapshot's matrices do
    /// not match `structure` exactly.
    pub fn from_snapshot(structure: Vec<usize>, snapshot: WeightsSnapshot, rng: StdRng) -> Result<Self> {
        check_structure(&structure)?;
        let expected = expected_shapes(&structure);
        let found = snapshot.shapes();
        if found != expected || snapshot.layers.iter().any(|m| m.iter().any(|row| row.len() != linear::shape(m).1)) {
            return Err(BrainError::InvalidArgument(format!(
                "weights have shapes {found:?} but the network needs {expected:?}"
            )));
        }
        Ok(Self::assemble(structure, snapshot, rng))
    }

    fn assemble(structure: Vec<usize>, snapshot: WeightsSnapshot, rng: StdRng) -> Self {
        Self {
            structure,
            canonical: Mutex::new(Canonical {
                weights: snapshot.layers.clone(),
                rng,
            }),
            serving: Mutex::new(snapshot),
        }
    }

    /// Forward pass over a batch with the canonical weights.
    ///
    /// Returns the activation of every layer after the input, each as a
    /// `[batch][units]` matrix. The last entry is the network output.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if any input has the wrong width.
    pub fn forward_batch(&self, inputs: &[Vec<f32>], beta: f32) -> Result<Vec<Matrix>> {
        self.check_inputs(inputs)?;
        let canonical = lock(&self.canonical);
        Ok(propagate(&canonical.weights, inputs, beta))
    }

    /// Forward pass of a single input with the serving generation.
    ///
    /// Holds the serving lock for exactly one forward pass, so the output
    /// always comes from a single published generation.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if `input` has the wrong width.
    pub fn forward_one(&self, input: &[f32]) -> Result<Vec<f32>> {
        let batch = [input.to_vec()];
        self.check_inputs(&batch)?;
        let mut activations = {
            let serving = lock(&self.serving);
            propagate(&serving.layers, &batch, serving.beta)
        };
        Ok(activations.pop().and_then(|mut out| out.pop()).unwrap_or_default())
    }

    /// Train the canonical weights on a full batch, then publish them.
    ///
    /// Each epoch backpropagates the squared error through a dropout-masked
    /// copy of the weights and takes a plain gradient step whose per-weight
    /// size grows by 10% while the gradient keeps its sign and shrinks by
    /// 10% when it flips. Step sizes restart at `0.01` on every call.
    ///
    /// The serving lock is taken only once, after the last epoch, to swap in
    /// the new weights together with `beta`.
    ///
    /// # Errors
    ///
    /// Returns [`BrainError::InvalidArgument`] if the batch is empty, if
    /// `inputs` and `targets` differ in length, or if any row has the wrong width.
    pub fn train(&self, inputs: &[Vec<f32>], targets: &[Vec<f32>], epochs: usize, beta: f32, dropout: f32) -> Result<()> {
        self.check_batch(inputs, targets)?;

        let mut canonical = lock(&self.canonical);
        let Canonical { weights, rng } = &mut *canonical;

        let mut rates: Vec<Matrix> = weights.iter().map(|w| linear::filled_like(w, INITIAL_RATE)).collect();
        let mut previous: Option<Vec<Matrix>> = None;

        for _ in 0..epochs {
            let masked: Vec<Matrix> = weights.iter().map(|w| dropout_mask(w, dropout, rng)).collect();
            let activations = propagate(weights, inputs, beta);
            let grads = gradients(inputs, targets, &activations, &masked, beta);

            if let Some(previous) = &previous {
                adapt_rates(&mut rates, &grads, previous);
            }

            for ((w, rate), grad) in weights.iter_mut().zip(&rates).zip(&grads) {
                for ((weight_row, rate_row), grad_row) in w.iter_mut().zip(rate).zip(grad) {
                    for ((w, r), g) in weight_row.iter_mut().zip(rate_row).zip(grad_row) {
                        *w -= r * g;
                    }
                }
            }

            previous = Some(grads);
        }

        let published = WeightsSnapshot {
            beta,
            layers: weights.clone(),
        };
        *lock(&self.serving) = published;
        Ok(())
    }

    /// Copy of the last published generation.
    ///
    /// Never waits on a training call. Between training calls this equals
    /// the canonical weights.
    #[must_use]
    pub fn snapshot(&self) -> WeightsSnapshot {
        lock(&self.serving).clone()
    }

    fn check_inputs(&self, inputs: &[Vec<f32>]) -> Result<()> {
        let width = self.structure[0];
        if let Some(bad) = inputs.iter().find(|row| row.len() != width) {
            return Err(BrainError::InvalidArgument(format!(
                "expected inputs of length {width}, got {}",
                bad.len()
            )));
        }
        Ok(())
    }

    fn check_batch(&self, inputs: &[Vec<f32>], targets: &[Vec<f32>]) -> Result<()> {
        if inputs.is_empty() {
            return Err(BrainError::InvalidArgument("training batch is empty".to_string()));
        }
        if inputs.len() != targets.len() {
            return Err(BrainError::InvalidArgument(format!(
                "got {} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        self.check_inputs(inputs)?;
        let width = self.structure[self.structure.len() - 1];
        if let Some(bad) = targets.iter().find(|row| row.len() != width) {
            return Err(BrainError::InvalidArgument(format!(
                "expected targets of length {width}, got {}",
                bad.len()
            )));
        }
        Ok(())
    }
}

/// Shapes of the bias-augmented matrices for a layer structure.
#[must_use]
pub fn expected_shapes(structure: &[usize]) -> Vec<(usize, usize)> {
    structure.windows(2).map(|pair| (pair[0] + 1, pair[1])).collect()
}

fn check_structure(structure: &[usize]) -> Result<()> {
    if structure.len() < 2 || structure.contains(&0) {
        return Err(BrainError::InvalidArgument(format!(
            "network structure {structure:?} needs at least two non-empty layers"
        )));
    }
    Ok(())
}

fn propagate(weights: &[Matrix], inputs: &[Vec<f32>], beta: f32) -> Vec<Matrix> {
    let mut activations: Vec<Matrix> = Vec::with_capacity(weights.len());
    for w in weights {
        let layer_input = activations.last().map_or(inputs, Vec::as_slice);
        let mut out = linear::affine(layer_input, w);
        activate(&mut out, beta);
        activations.push(out);
    }
    activations
}

fn dropout_mask(weights: &[Vec<f32>], rate: f32, rng: &mut StdRng) -> Matrix {
    weights
        .iter()
        .map(|row| {
            row.iter()
                .map(|&w| if rng.gen::<f32>() < rate { 0.0 } else { w })
                .collect()
        })
        .collect()
}

/// Per-weight gradient sums over the batch, one matrix per layer.
fn gradients(inputs: &[Vec<f32>], targets: &[Vec<f32>], activations: &[Matrix], masked: &[Matrix], beta: f32) -> Vec<Matrix> {
    let layers = activations.len();
    let output = &activations[layers - 1];

    // output error signal: squared error through the sigmoid
    let mut delta: Matrix = output
        .iter()
        .zip(targets)
        .map(|(out_row, target_row)| out_row.iter().zip(target_row).map(|(&o, &t)| (o - t) * slope(o)).collect())
        .collect();

    let mut grads: Vec<Matrix> = vec![Vec::new(); layers];
    for layer in (0..layers).rev() {
        let layer_input = if layer == 0 { inputs } else { activations[layer - 1].as_slice() };
        grads[layer] = linear::transpose_matmul(&linear::with_bias(layer_input), &delta);

        if layer > 0 {
            // the bias column of the portion has no unit behind it and is dropped by the zip
            let portion = linear::matmul_transpose(&delta, &masked[layer]);
            delta = activations[layer - 1]
                .iter()
                .zip(&portion)
                .map(|(hidden_row, portion_row)| hidden_row.iter().zip(portion_row).map(|(&h, &p)| beta * slope(h) * p).collect())
                .collect();
        }
    }
    grads
}

fn adapt_rates(rates: &mut [Matrix], grads: &[Matrix], previous: &[Matrix]) {
    for ((rate, grad), prev) in rates.iter_mut().zip(grads).zip(previous) {
        for ((rate_row, grad_row), prev_row) in rate.iter_mut().zip(grad).zip(prev) {
            for ((r, g), p) in rate_row.iter_mut().zip(grad_row).zip(prev_row) {
                let agreement = g * p;
                if agreement > 0.0 {
                    *r *= RATE_GROWTH;
                } else if agreement < 0.0 {
                    *r *= RATE_DECAY;
                }
            }
        }
    }
}
