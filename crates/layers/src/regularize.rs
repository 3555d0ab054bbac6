//! Dropout and stochastic-depth regularisers for the residual branches.
//!
//! Both regularisers are driven by a deterministic seeded generator so tests
//! can pin masks. [`Dropout`] zeroes individual elements; [`DropPath`] zeroes
//! a residual branch for entire images at a time, which is the stochastic
//! depth scheme used on both branches of every encoder block. Surviving
//! values are rescaled by `1 / (1 - p)` to preserve expected magnitude, and
//! both are exact identities at inference.

use std::fmt;
use std::sync::Mutex;

use candle_core::{DType, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

fn validate_probability(p: f32) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::Msg(format!(
            "drop probability must be in [0, 1), got {p}"
        )));
    }
    Ok(())
}

/// Element-wise dropout over `(set, hidden)` tensors.
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout layer; probability zero disables it entirely.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        validate_probability(probability)?;
        Ok(Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
        })
    }

    /// Applies the element mask when training, identity otherwise.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy, train: bool) -> Result<Tensor> {
        if !train || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let dims = input.dims();
        checks::expect_set_hidden("dropout.input", input, dims[dims.len() - 1])?;

        let keep_prob = 1.0 - self.probability;
        let total = input.elem_count();
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
        let mask_data: Vec<f32> = (0..total)
            .map(|_| if rng.next_f32() < keep_prob { 1.0 } else { 0.0 })
            .collect();
        drop(rng);

        apply_mask(input, mask_data, dims.to_vec(), keep_prob, policy)
    }
}

/// Stochastic depth: drops a residual branch per image.
pub struct DropPath {
    probability: f32,
    rng: Mutex<Lcg64>,
}

impl fmt::Debug for DropPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DropPath")
            .field("probability", &self.probability)
            .finish()
    }
}

impl DropPath {
    /// Creates a drop-path regulariser; probability zero disables it.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        validate_probability(probability)?;
        Ok(Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
        })
    }

    /// Drop probability configured for this branch.
    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Zeroes the branch output for a random subset of images when training.
    ///
    /// The mask is shaped `(set, 1)` and broadcast across the hidden axis, so
    /// an image either keeps its entire branch contribution (rescaled by
    /// `1 / keep_prob`) or loses it completely.
    pub fn forward(
        &self,
        branch: &Tensor,
        policy: &PrecisionPolicy,
        train: bool,
    ) -> Result<Tensor> {
        if !train || self.probability == 0.0 {
            return Ok(branch.clone());
        }
        let dims = branch.dims();
        checks::expect_set_hidden("drop_path.input", branch, dims[dims.len() - 1])?;
        let set = dims[0];

        let keep_prob = 1.0 - self.probability;
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Msg("drop_path RNG mutex poisoned".into()))?;
        let mask_data: Vec<f32> = (0..set)
            .map(|_| if rng.next_f32() < keep_prob { 1.0 } else { 0.0 })
            .collect();
        drop(rng);

        apply_mask(branch, mask_data, vec![set, 1], keep_prob, policy)
    }
}

fn apply_mask(
    input: &Tensor,
    mask_data: Vec<f32>,
    mask_shape: Vec<usize>,
    keep_prob: f32,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let dtype = policy.compute();
    checks::ensure_cast_supported("regularize.mask", DType::F32, dtype)?;
    let mask = Tensor::from_vec(mask_data, mask_shape, input.device())?.to_dtype(dtype)?;
    let compute = policy.cast_for_matmul(input)?;
    let masked = compute
        .broadcast_mul(&mask)?
        .affine(1.0 / keep_prob as f64, 0.0)?;
    policy.cast_to_storage(&masked)
}

/// 64-bit linear congruential generator for deterministic masks.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Parameters from Numerical Recipes.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
