//! Building blocks for the image-set refinement encoder.
//!
//! Everything in this crate operates on rank-2 tensors following the
//! `(set, hidden)` convention: the first axis indexes images in the input
//! set, the second is the embedding dimension. Components promote through a
//! shared [`PrecisionPolicy`] so parameters can live in reduced precision
//! while matmuls and reductions run in `f32`.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod regularize;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
pub use regularize::{DropPath, Dropout};
