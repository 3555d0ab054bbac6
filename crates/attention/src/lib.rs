//! Scaled dot-product attention over an image set.
//!
//! The kernel attends across the set axis: for a query image `i` and key
//! image `j`, the attention weight is the softmax over scaled dot products of
//! their per-head query/key vectors, and the output for `i` is the weighted
//! sum of value vectors across the whole set. Inputs are rank-3
//! `(heads, set, head_dim)` views produced by the model crate's head split.

pub mod config;
pub mod errors;
pub mod exact;

pub use config::Config;
pub use errors::AttentionError;
pub use exact::ExactAttention;
