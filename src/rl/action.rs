use rand::Rng;

/// Motor action, index-aligned with the network outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Forward,
    Left,
    Right,
    Backward,
    Hold,
}

impl Action {
    pub const VARIANTS: &'static [Action] = &[Self::Forward, Self::Left, Self::Right, Self::Backward, Self::Hold];

    /// Number of actions, and width of every action-value vector.
    pub const COUNT: usize = 5;

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Action::Forward => 0,
            Action::Left => 1,
            Action::Right => 2,
            Action::Backward => 3,
            Action::Hold => 4,
        }
    }

    /// One-hot encoding handed to the motor controller.
    #[must_use]
    pub fn one_hot(self) -> [u8; Self::COUNT] {
        let mut encoded = [0; Self::COUNT];
        encoded[self.index()] = 1;
        encoded
    }

    /// Index of the largest value. Ties go to the lowest index.
    ///
    /// NaN entries never win; an all-NaN vector yields [`Action::Forward`].
    #[must_use]
    pub fn greedy(values: &[f32]) -> Self {
        let (index, _) = values
            .iter()
            .take(Self::COUNT)
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best_idx, best_val), (idx, &val)| {
                if val > best_val {
                    (idx, val)
                } else {
                    (best_idx, best_val)
                }
            });
        Self::VARIANTS[index]
    }

    /// Uniformly random action.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self::VARIANTS[rng.gen_range(0..Self::COUNT)]
    }
}
