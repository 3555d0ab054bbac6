//! Position-wise feed-forward block used inside every encoder block.
//!
//! The MLP operates on `(set, hidden)` tensors and returns the same layout:
//! `fc1` expands the hidden dimension to `intermediate_size`, the activation
//! applies, dropout thins the activations, `fc2` contracts back to the model
//! hidden size, and dropout applies again. Both dropout applications share
//! one mask generator, mirroring the single dropout module the block reuses.

use std::sync::Arc;

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    regularize::Dropout,
};

/// Configuration for the encoder feed-forward network.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Dropout probability applied after the activation and after `fc2`.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    /// Creates a standard two-projection MLP configuration.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            dropout_p: 0.0,
        }
    }

    /// Builds a configuration whose intermediate width is
    /// `round(hidden_size * ratio)`.
    pub fn with_expansion_ratio(hidden_size: usize, ratio: f32, activation: ActivationKind) -> Self {
        let intermediate = ((hidden_size as f64) * f64::from(ratio)).round() as usize;
        Self::new(hidden_size, intermediate.max(1), activation)
    }
}

/// Two-projection feed-forward block with activation and dropout.
pub struct FeedForward {
    config: FeedForwardConfig,
    fc1: Linear,
    fc2: Linear,
    activation: Arc<dyn Activation>,
    dropout: Dropout,
}

impl FeedForward {
    /// Builds the block, sampling both projection weights from `init`.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let fc1 = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            init,
            device,
            dtype,
        )?;
        let fc2 = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        let activation = builtin(config.activation);
        let dropout = Dropout::new(config.dropout_p, seed)?;
        Ok(Self {
            config,
            fc1,
            fc2,
            activation,
            dropout,
        })
    }

    /// Configuration metadata used during block assembly.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Trainable parameters with a dotted scope prefix.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.fc1.named_parameters(&format!("{scope}.fc1"));
        params.extend(self.fc2.named_parameters(&format!("{scope}.fc2")));
        params
    }

    /// Forward pass through the MLP.
    pub fn forward(
        &self,
        hidden: &Tensor,
        policy: &PrecisionPolicy,
        train: bool,
    ) -> Result<Tensor> {
        let expanded = self.fc1.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        let thinned = self.dropout.forward(&activated, policy, train)?;
        let contracted = self.fc2.forward(&thinned, policy)?;
        self.dropout.forward(&contracted, policy, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn build_block(hidden: usize, ratio: f32, dropout_p: f32) -> Result<FeedForward> {
        let mut config = FeedForwardConfig::with_expansion_ratio(hidden, ratio, ActivationKind::Gelu);
        config.dropout_p = dropout_p;
        FeedForward::with_init(
            config,
            &LinearInit::TruncNormal { std: 0.02 },
            0,
            &Device::Cpu,
            DType::F32,
        )
    }

    #[test]
    fn expansion_ratio_sizes_the_intermediate_dim() {
        let config = FeedForwardConfig::with_expansion_ratio(8, 4.0, ActivationKind::Gelu);
        assert_eq!(config.intermediate_size, 32);
        let config = FeedForwardConfig::with_expansion_ratio(10, 1.5, ActivationKind::Gelu);
        assert_eq!(config.intermediate_size, 15);
    }

    #[test]
    fn forward_preserves_layout_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let block = build_block(8, 4.0, 0.0)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (3, 8), &device)?;
        let output = block.forward(&input, &policy, false)?;
        assert_eq!(output.dims(), &[3, 8]);
        assert_eq!(output.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn eval_forward_is_deterministic_despite_dropout() -> Result<()> {
        let device = Device::Cpu;
        let block = build_block(8, 2.0, 0.5)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (4, 8), &device)?;
        let first = block.forward(&input, &policy, false)?;
        let second = block.forward(&input, &policy, false)?;
        let diff = first.sub(&second)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn matches_manual_composition_without_dropout() -> Result<()> {
        let device = Device::Cpu;
        let block = build_block(6, 4.0, 0.0)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (2, 6), &device)?;

        let output = block.forward(&input, &policy, true)?;
        let manual = {
            let expanded = block.fc1.forward(&input, &policy)?;
            let activated = expanded.gelu_erf()?;
            block.fc2.forward(&activated, &policy)?
        };
        let diff = output.sub(&manual)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn parameters_cover_both_projections() -> Result<()> {
        let block = build_block(4, 4.0, 0.0)?;
        let names: Vec<String> = block
            .named_parameters("mlp")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["mlp.fc1.weight", "mlp.fc1.bias", "mlp.fc2.weight", "mlp.fc2.bias"]
        );
        Ok(())
    }
}
