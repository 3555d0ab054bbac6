//! Configuration options shared by attention call sites.

/// Run-time knobs for the attention kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, attention-weight dropout is disabled and the computation
    /// is deterministic.
    pub dropout_p: Option<f32>,
    /// Overrides the default query/key scale of `head_dim.powf(-0.5)`.
    pub scale: Option<f32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropout_p: None,
            scale: None,
        }
    }
}

impl Config {
    /// Effective scale applied to the raw dot-product scores.
    pub fn effective_scale(&self, head_dim: usize) -> f32 {
        self.scale
            .unwrap_or_else(|| (head_dim as f32).powf(-0.5))
    }
}
