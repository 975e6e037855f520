/// Logistic activation with steepness `beta`: `1 / (1 + exp(-beta * z))`.
///
/// Very negative inputs saturate to `0.0` instead of producing NaN.
#[must_use]
pub fn sigmoid(z: f32, beta: f32) -> f32 {
    1.0 / (1.0 + (-beta * z).exp())
}

/// Apply [`sigmoid`] to every element in place.
pub fn activate(m: &mut [Vec<f32>], beta: f32) {
    for x in m.iter_mut().flatten() {
        *x = sigmoid(*x, beta);
    }
}

/// Derivative of the sigmoid expressed through its output, without `beta`.
#[must_use]
pub fn slope(output: f32) -> f32 {
    output * (1.0 - output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_midpoint_and_steepness() {
        assert!((sigmoid(0.0, 0.01) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0, 1.0) > sigmoid(10.0, 0.1));
        assert!((sigmoid(2.0, 0.5) - sigmoid(1.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_sigmoid_saturates_without_nan() {
        let low = sigmoid(-1.0e6, 1.0);
        let high = sigmoid(1.0e6, 1.0);
        assert_eq!(low, 0.0);
        assert_eq!(high, 1.0);
    }

    #[test]
    fn test_activate_and_slope() {
        let mut m = vec![vec![0.0, 0.0]];
        activate(&mut m, 3.0);
        assert_eq!(m, vec![vec![0.5, 0.5]]);
        assert!((slope(0.5) - 0.25).abs() < 1e-6);
    }
}
