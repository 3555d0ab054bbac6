//! The assembled image-set refinement encoder.

use std::sync::OnceLock;

use candle_core::{Result, Tensor, Var};
use layers::{dtypes::PrecisionPolicy, norm::NormConfig, Dropout, LayerNorm};

use crate::{adapter::FeatureAdapter, block::EncoderBlock, config::EncoderConfig};

/// Seed for the token-level dropout applied right after the adapter. Block
/// seeds start at zero and advance by four per block, so this stays clear.
const POS_DROP_SEED: u64 = u64::MAX;

/// Linear stochastic-depth decay: block `i` of `depth` gets
/// `i * final_rate / (depth - 1)`, so the first block never drops and the
/// last block drops at the configured rate.
pub fn drop_path_schedule(depth: usize, final_rate: f32) -> Vec<f32> {
    if depth <= 1 {
        return vec![0.0; depth];
    }
    (0..depth)
        .map(|i| final_rate * i as f32 / (depth - 1) as f32)
        .collect()
}

/// Vision-Transformer-style encoder over an image set.
///
/// Pipeline: feature adapter (flatten, optional norm) -> token dropout ->
/// `depth` pre-norm residual blocks -> final LayerNorm. The output keeps the
/// `(set, embed_dim)` layout so each image's refined embedding can be read
/// off its row.
pub struct SetEncoder {
    config: EncoderConfig,
    adapter: FeatureAdapter,
    pos_drop: Dropout,
    blocks: Vec<EncoderBlock>,
    final_norm: LayerNorm,
    policy: PrecisionPolicy,
    first_call: OnceLock<()>,
}

impl SetEncoder {
    /// Builds the encoder and its component blocks according to `config`.
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);

        let adapter = FeatureAdapter::new(
            config.feature_rows,
            config.feature_cols,
            config.normalize_input,
        );
        let pos_drop = Dropout::new(config.drop_p, POS_DROP_SEED)?;

        let rates = drop_path_schedule(config.depth, config.drop_path_p);
        let mut blocks = Vec::with_capacity(config.depth);
        for (index, rate) in rates.iter().enumerate() {
            blocks.push(EncoderBlock::new(index, &config, *rate)?);
        }

        let final_norm = LayerNorm::with_init(
            NormConfig::new(config.embed_dim()),
            &config.device,
            config.dtype,
        )?;

        Ok(Self {
            config,
            adapter,
            pos_drop,
            blocks,
            final_norm,
            policy,
            first_call: OnceLock::new(),
        })
    }

    /// Returns the encoder configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Trainable parameters across the whole encoder with dotted scopes.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = Vec::new();
        for (index, block) in self.blocks.iter().enumerate() {
            params.extend(block.named_parameters(&format!("blocks.{index}")));
        }
        params.extend(self.final_norm.named_parameters("norm"));
        params
    }

    /// Refines per-image embeddings by attending over the whole set.
    ///
    /// `features` must be shaped `(set, feature_rows, feature_cols)`; the
    /// result is `(set, embed_dim)` in the configured storage dtype. Each
    /// output row depends on every image in the set.
    pub fn forward(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "set-encoder init depth={} heads={} embed_dim={} dtype={:?} drop_p={} attn_drop_p={} drop_path_p={}",
                self.config.depth,
                self.config.num_heads,
                self.config.embed_dim(),
                self.config.dtype,
                self.config.drop_p,
                self.config.attn_drop_p,
                self.config.drop_path_p
            );
        }

        let tokens = self.adapter.forward(features, &self.policy)?;
        let mut hidden = self.pos_drop.forward(&tokens, &self.policy, train)?;

        for block in &self.blocks {
            hidden = block.forward(&hidden, train)?;
        }

        self.final_norm.forward(&hidden, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_decays_linearly_to_the_final_rate() {
        let rates = drop_path_schedule(5, 0.2);
        assert_eq!(rates.len(), 5);
        assert_eq!(rates[0], 0.0);
        assert!((rates[4] - 0.2).abs() < 1e-7);
        for window in rates.windows(2) {
            let step = window[1] - window[0];
            assert!((step - 0.05).abs() < 1e-6);
        }
    }

    #[test]
    fn single_block_schedule_never_drops() {
        assert_eq!(drop_path_schedule(1, 0.5), vec![0.0]);
    }
}
