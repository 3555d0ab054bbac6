//! Bridges external per-image feature tensors into token vectors.

use candle_core::{Result, Tensor};
use layers::{checks, norm::NormConfig, LayerNorm, PrecisionPolicy};

/// Flattens each image's `(rows, cols)` feature grid into a single token
/// and optionally normalises it.
///
/// The normalisation, when enabled, is a non-affine LayerNorm: it whitens
/// the flattened features without introducing parameters ahead of the
/// encoder blocks' own learnable norms.
#[derive(Debug)]
pub struct FeatureAdapter {
    rows: usize,
    cols: usize,
    norm: Option<LayerNorm>,
}

impl FeatureAdapter {
    /// Builds an adapter for `(rows, cols)` feature grids.
    pub fn new(rows: usize, cols: usize, normalize: bool) -> Self {
        let norm = normalize.then(|| LayerNorm::without_affine(NormConfig::new(rows * cols)));
        Self { rows, cols, norm }
    }

    /// Embedding dimension produced per image.
    pub fn embed_dim(&self) -> usize {
        self.rows * self.cols
    }

    /// Converts `(set, rows, cols)` features into `(set, rows * cols)` tokens.
    pub fn forward(&self, features: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("adapter.input", features, 3)?;
        let set = features.dims()[0];
        checks::expect_shape("adapter.input", features, &[set, self.rows, self.cols])?;

        let tokens = features.reshape((set, self.embed_dim()))?;
        checks::expect_set_hidden("adapter.tokens", &tokens, self.embed_dim())?;

        match &self.norm {
            Some(norm) => norm.forward(&tokens, policy),
            None => Ok(tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn flattens_row_major() -> Result<()> {
        let device = Device::Cpu;
        let adapter = FeatureAdapter::new(2, 3, false);
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let features = Tensor::from_vec(data.clone(), (2, 2, 3), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let tokens = adapter.forward(&features, &policy)?;
        assert_eq!(tokens.dims(), &[2, 6]);
        let flat = tokens.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(flat, data);
        Ok(())
    }

    #[test]
    fn normalised_tokens_have_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        let adapter = FeatureAdapter::new(4, 8, true);
        let features = Tensor::randn(0f32, 3.0, (3, 4, 8), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let tokens = adapter.forward(&features, &policy)?;
        let rows = tokens.to_vec2::<f32>()?;
        for row in rows {
            let n = row.len() as f32;
            let mean = row.iter().sum::<f32>() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn wrong_grid_shape_errors() -> Result<()> {
        let device = Device::Cpu;
        let adapter = FeatureAdapter::new(18, 512, false);
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let wrong_cols = Tensor::zeros((3, 18, 256), DType::F32, &device)?;
        assert!(adapter.forward(&wrong_cols, &policy).is_err());

        let wrong_rank = Tensor::zeros((3, 18 * 512), DType::F32, &device)?;
        assert!(adapter.forward(&wrong_rank, &policy).is_err());

        let empty_set = Tensor::zeros((0, 18, 512), DType::F32, &device)?;
        assert!(adapter.forward(&empty_set, &policy).is_err());
        Ok(())
    }
}
