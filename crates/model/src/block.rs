//! Pre-norm residual encoder block.

use std::fmt;

use attention::{Config as AttentionConfig, ExactAttention};
use candle_core::{bail, Error, Result, Tensor, Var};
use layers::{
    activations::ActivationKind,
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::{FeedForward, FeedForwardConfig},
    norm::NormConfig,
    DropPath, Dropout, LayerNorm,
};

use crate::config::EncoderConfig;

/// Weight initialisation shared by every projection in the encoder:
/// truncated normal with standard deviation 0.01, zero bias.
pub(crate) const WEIGHT_INIT: LinearInit = LinearInit::TruncNormal { std: 0.01 };

/// One transformer encoder block over the image set.
///
/// Layout is pre-norm on both branches, with the residual additions using
/// the un-normalised input and an independent stochastic-depth gate on each
/// branch:
///
/// `x = x + drop_path(proj_drop(proj(attend(split_heads(qkv(norm1(x)))))))`
/// `x = x + drop_path(mlp(norm2(x)))`
pub struct EncoderBlock {
    embed_dim: usize,
    heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    norm_attn: LayerNorm,
    norm_mlp: LayerNorm,
    qkv: Linear,
    proj: Linear,
    proj_drop: Dropout,
    mlp: FeedForward,
    attention: ExactAttention,
    attn_cfg: AttentionConfig,
    drop_path: DropPath,
}

impl fmt::Debug for EncoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderBlock")
            .field("embed_dim", &self.embed_dim)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .field("drop_path_p", &self.drop_path.probability())
            .finish()
    }
}

impl EncoderBlock {
    /// Constructs block `index` of the stack with its own stochastic-depth
    /// rate from the linear decay schedule.
    pub fn new(index: usize, config: &EncoderConfig, drop_path_p: f32) -> Result<Self> {
        let embed_dim = config.embed_dim();
        let policy = PrecisionPolicy::from_parameter_dtype(config.dtype);

        let norm_attn = LayerNorm::with_init(
            NormConfig::new(embed_dim),
            &config.device,
            config.dtype,
        )?;
        let norm_mlp = LayerNorm::with_init(
            NormConfig::new(embed_dim),
            &config.device,
            config.dtype,
        )?;

        let mut qkv_config = LinearConfig::new(embed_dim, embed_dim);
        qkv_config.bias = config.qkv_bias;
        qkv_config.fused_projections = 3;
        let qkv = Linear::with_init(qkv_config, &WEIGHT_INIT, &config.device, config.dtype)?;

        let proj = Linear::with_init(
            LinearConfig::new(embed_dim, embed_dim),
            &WEIGHT_INIT,
            &config.device,
            config.dtype,
        )?;

        let mut ff_config = FeedForwardConfig::with_expansion_ratio(
            embed_dim,
            config.mlp_ratio,
            ActivationKind::Gelu,
        );
        ff_config.dropout_p = config.drop_p;

        // Distinct deterministic seeds per block keep the masks independent
        // across the stack and reproducible across runs.
        let base_seed = (index as u64).saturating_mul(4);
        let mlp = FeedForward::with_init(
            ff_config,
            &WEIGHT_INIT,
            base_seed,
            &config.device,
            config.dtype,
        )?;
        let proj_drop = Dropout::new(config.drop_p, base_seed + 1)?;
        let drop_path = DropPath::new(drop_path_p, base_seed + 2)?;

        let attn_cfg = AttentionConfig {
            dropout_p: (config.attn_drop_p > 0.0).then_some(config.attn_drop_p),
            scale: config.qk_scale,
        };

        Ok(Self {
            embed_dim,
            heads: config.num_heads,
            head_dim: config.head_dim(),
            policy,
            norm_attn,
            norm_mlp,
            qkv,
            proj,
            proj_drop,
            mlp,
            attention: ExactAttention::new(),
            attn_cfg,
            drop_path,
        })
    }

    /// Trainable parameters with a dotted scope prefix.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.norm_attn.named_parameters(&format!("{scope}.norm1"));
        params.extend(self.qkv.named_parameters(&format!("{scope}.qkv")));
        params.extend(self.proj.named_parameters(&format!("{scope}.proj")));
        params.extend(self.norm_mlp.named_parameters(&format!("{scope}.norm2")));
        params.extend(self.mlp.named_parameters(&format!("{scope}.mlp")));
        params
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        checks::expect_set_hidden("attention.input", tensor, self.embed_dim)?;
        let set = tensor.dims()[0];
        let per_head = tensor.reshape((set, self.heads, self.head_dim))?;
        per_head.permute((1, 0, 2))?.contiguous()
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != 3 {
            bail!("attention output expected [heads, set, head_dim], got {dims:?}");
        }
        let set = dims[1];
        let merged = tensor.permute((1, 0, 2))?.contiguous()?;
        merged.reshape((set, self.embed_dim))
    }

    /// Forward pass through the block.
    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.norm_attn.forward(hidden, &self.policy)?;
        let qkv = self.qkv.forward(&normed, &self.policy)?;

        let q = qkv.narrow(1, 0, self.embed_dim)?;
        let k = qkv.narrow(1, self.embed_dim, self.embed_dim)?;
        let v = qkv.narrow(1, 2 * self.embed_dim, self.embed_dim)?;

        let q_heads = self.split_heads(&q)?;
        let k_heads = self.split_heads(&k)?;
        let v_heads = self.split_heads(&v)?;

        let attended = self
            .attention
            .attend(&q_heads, &k_heads, &v_heads, &self.attn_cfg, train)
            .map_err(|e| Error::Msg(e.to_string()))?;
        let merged = self.merge_heads(&attended)?;
        let projected = self.proj.forward(&merged, &self.policy)?;
        let branch = self.proj_drop.forward(&projected, &self.policy, train)?;
        let branch = self.drop_path.forward(&branch, &self.policy, train)?;
        let after_attn = hidden.add(&branch)?;

        let normed_mlp = self.norm_mlp.forward(&after_attn, &self.policy)?;
        let mlp_out = self.mlp.forward(&normed_mlp, &self.policy, train)?;
        let mlp_branch = self.drop_path.forward(&mlp_out, &self.policy, train)?;
        after_attn.add(&mlp_branch)
    }
}
