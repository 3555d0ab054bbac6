//! High-level configuration for assembling the set encoder.

use candle_core::{DType, Device, Error, Result};

/// Configuration for the image-set refinement encoder.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Expected number of images per set. Advisory: any non-empty set flows
    /// through the forward pass.
    pub set_size: usize,
    /// Rows of each per-image feature grid.
    pub feature_rows: usize,
    /// Columns of each per-image feature grid.
    pub feature_cols: usize,
    /// Number of stacked encoder blocks.
    pub depth: usize,
    /// Number of attention heads per block.
    pub num_heads: usize,
    /// Ratio of the MLP hidden width to the embedding dimension.
    pub mlp_ratio: f32,
    /// Enables bias on the fused query/key/value projection.
    pub qkv_bias: bool,
    /// Overrides the default query/key scale of `head_dim.powf(-0.5)`.
    pub qk_scale: Option<f32>,
    /// Dropout on token embeddings, MLP activations, and the attention
    /// output projection.
    pub drop_p: f32,
    /// Dropout on the attention weights.
    pub attn_drop_p: f32,
    /// Final stochastic-depth rate; per-block rates decay linearly from zero
    /// up to this value.
    pub drop_path_p: f32,
    /// Applies a non-affine LayerNorm after flattening each feature grid.
    pub normalize_input: bool,
    /// Storage dtype for every parameter.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

impl EncoderConfig {
    /// Embedding dimension derived from the flattened feature grid.
    pub fn embed_dim(&self) -> usize {
        self.feature_rows * self.feature_cols
    }

    /// Per-head embedding dimension.
    pub fn head_dim(&self) -> usize {
        self.embed_dim() / self.num_heads
    }

    /// The shape the encoder was originally driven with: sets of three
    /// images carrying `(18, 512)` feature grids, four blocks, eight heads.
    pub fn small(device: Device) -> Self {
        Self {
            set_size: 3,
            feature_rows: 18,
            feature_cols: 512,
            depth: 4,
            num_heads: 8,
            mlp_ratio: 4.0,
            qkv_bias: true,
            qk_scale: None,
            drop_p: 0.0,
            attn_drop_p: 0.0,
            drop_path_p: 0.0,
            normalize_input: false,
            dtype: DType::F32,
            device,
        }
    }

    /// ViT-Base-style depth and head count on top of the fixed feature
    /// grids. The 9216-wide embedding splits into twelve 768-wide heads.
    pub fn base(device: Device) -> Self {
        Self {
            depth: 12,
            num_heads: 12,
            ..Self::small(device)
        }
    }

    /// Validates the structural invariants before assembly.
    pub fn validate(&self) -> Result<()> {
        if self.set_size == 0 {
            return Err(Error::Msg("set_size must be greater than zero".into()));
        }
        if self.feature_rows == 0 || self.feature_cols == 0 {
            return Err(Error::Msg(
                "feature grid dimensions must be greater than zero".into(),
            ));
        }
        if self.depth == 0 {
            return Err(Error::Msg("depth must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(Error::Msg("num_heads must be greater than zero".into()));
        }
        if self.embed_dim() % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim(),
                self.num_heads
            )));
        }
        if self.mlp_ratio <= 0.0 {
            return Err(Error::Msg("mlp_ratio must be positive".into()));
        }
        for (name, p) in [
            ("drop_p", self.drop_p),
            ("attn_drop_p", self.attn_drop_p),
            ("drop_path_p", self.drop_path_p),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}
