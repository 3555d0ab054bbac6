//! Image-set refinement encoder.
//!
//! A Vision-Transformer-style encoder whose token axis is the image set
//! itself: each image contributes one token, built by flattening its
//! pre-extracted feature grid. Self-attention across the set makes every
//! refined embedding a joint function of all images in the set.

pub mod adapter;
pub mod block;
pub mod config;
pub mod model;

pub use adapter::FeatureAdapter;
pub use block::EncoderBlock;
pub use config::EncoderConfig;
pub use model::SetEncoder;
