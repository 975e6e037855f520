//! Bias-augmented weight matrices and the small amount of matrix algebra the
//! network needs.
use rand::Rng;

/// Row-major matrix: `[rows][cols]`.
pub type Matrix = Vec<Vec<f32>>;

/// Create a `(input_size + 1) x output_size` weight matrix drawn uniformly
/// from `[-limit, limit)`. The last row holds the bias weights.
pub fn init_uniform<R: Rng>(input_size: usize, output_size: usize, limit: f32, rng: &mut R) -> Matrix {
    (0..=input_size)
        .map(|_| (0..output_size).map(|_| rng.gen_range(-limit..limit)).collect())
        .collect()
}

/// A matrix of the same shape as `like` filled with `value`.
#[must_use]
pub fn filled_like(like: &[Vec<f32>], value: f32) -> Matrix {
    like.iter().map(|row| vec![value; row.len()]).collect()
}

/// `(rows, cols)` of a matrix. An empty matrix has shape `(0, 0)`.
#[must_use]
pub fn shape(m: &[Vec<f32>]) -> (usize, usize) {
    (m.len(), m.first().map_or(0, Vec::len))
}

/// Append a constant `1.0` column so the last weight row acts as a bias.
#[must_use]
pub fn with_bias(batch: &[Vec<f32>]) -> Matrix {
    batch
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.push(1.0);
            row
        })
        .collect()
}

/// `a * b`
#[must_use]
pub fn matmul(a: &[Vec<f32>], b: &[Vec<f32>]) -> Matrix {
    let cols = shape(b).1;
    a.iter()
        .map(|left_row| {
            let mut out = vec![0.0; cols];
            for (x, right_row) in left_row.iter().zip(b) {
                for (o, w) in out.iter_mut().zip(right_row) {
                    *o += x * w;
                }
            }
            out
        })
        .collect()
}

/// `a^T * b`, where `a` and `b` share their row count.
#[must_use]
pub fn transpose_matmul(a: &[Vec<f32>], b: &[Vec<f32>]) -> Matrix {
    let (_, a_cols) = shape(a);
    let (_, b_cols) = shape(b);
    let mut out = vec![vec![0.0; b_cols]; a_cols];
    for (left_row, right_row) in a.iter().zip(b) {
        for (out_row, x) in out.iter_mut().zip(left_row) {
            for (o, y) in out_row.iter_mut().zip(right_row) {
                *o += x * y;
            }
        }
    }
    out
}

/// `a * b^T`, where `a` and `b` share their column count.
#[must_use]
pub fn matmul_transpose(a: &[Vec<f32>], b: &[Vec<f32>]) -> Matrix {
    a.iter()
        .map(|left_row| {
            b.iter()
                .map(|right_row| left_row.iter().zip(right_row).map(|(x, y)| x * y).sum())
                .collect()
        })
        .collect()
}

/// Bias-augmented affine transform of a batch: `[batch | 1] * weights`.
#[must_use]
pub fn affine(batch: &[Vec<f32>], weights: &[Vec<f32>]) -> Matrix {
    matmul(&with_bias(batch), weights)
}
