/// Sum of squared differences across one prediction vector.
#[must_use]
pub fn squared_error(pred: &[f32], target: &[f32]) -> f32 {
    pred.iter().zip(target).map(|(p, t)| (t - p) * (t - p)).sum()
}

/// Squared error summed across actions, averaged across samples.
///
/// Returns `0.0` for an empty batch.
#[must_use]
pub fn mean_squared_error(preds: &[Vec<f32>], targets: &[Vec<f32>]) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    let total: f32 = preds
        .iter()
        .zip(targets)
        .map(|(p, t)| squared_error(p, t))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let count = targets.len() as f32;
    total / count
}
