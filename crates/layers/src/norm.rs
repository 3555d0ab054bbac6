//! Layer normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(set, hidden)` convention and normalisation happens
//! along the hidden axis. Statistics (mean, variance) are promoted to
//! [`PrecisionPolicy::reduction`] before the output is cast back to the
//! storage dtype. The pre-norm encoder blocks and the final norm both use
//! the affine form; the feature adapter uses the non-affine form.

use candle_core::{DType, Device, Error, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by the normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether learnable affine parameters are applied after normalising.
    pub elementwise_affine: bool,
}

impl NormConfig {
    /// Defaults aligned with the encoder blocks (epsilon 1e-6).
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
            elementwise_affine: true,
        }
    }
}

/// LayerNorm with optional learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Var>,
    bias: Option<Var>,
}

impl LayerNorm {
    /// Constructs a LayerNorm from pre-existing affine parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = true;
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        checks::expect_dtype_in(
            "norm.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_same_dtype("norm.weight", &weight, "norm.bias", &bias)?;
        Ok(Self {
            config,
            weight: Some(Var::from_tensor(&weight)?),
            bias: Some(Var::from_tensor(&bias)?),
        })
    }

    /// Builds an affine LayerNorm initialised to scale one and bias zero.
    pub fn with_init(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Constructs a LayerNorm without affine parameters (scale 1, bias 0).
    pub fn without_affine(mut config: NormConfig) -> Self {
        config.elementwise_affine = false;
        Self {
            config,
            weight: None,
            bias: None,
        }
    }

    /// Returns the configuration so callers can check shape compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Trainable parameters with a dotted scope prefix. Empty for the
    /// non-affine form.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        if let Some(weight) = &self.weight {
            params.push((format!("{scope}.weight"), weight.clone()));
        }
        if let Some(bias) = &self.bias {
            params.push((format!("{scope}.bias"), bias.clone()));
        }
        params
    }

    /// Applies the normalisation to a `(set, hidden)` tensor.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_set_hidden("norm.input", hidden, self.config.hidden_size)?;
        if self.config.elementwise_affine && self.weight.is_none() {
            return Err(Error::Msg(
                "affine norm is missing its scale parameter".into(),
            ));
        }

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }

        if let Some(weight) = &self.weight {
            let weight = weight.as_tensor().to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_mul(&weight)?;
        }
        if let Some(bias) = &self.bias {
            let bias = bias.as_tensor().to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
