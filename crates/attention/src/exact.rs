//! Reference attention kernel for image-set tokens.
//!
//! Prioritises numerical fidelity: scores are accumulated in `f32` whenever
//! inputs arrive in reduced precision, and the softmax runs through the
//! numerically stable kernel exposed by Candle.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::{config::Config, errors::AttentionError};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    /// Constructs a reference attention kernel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attends over the image set.
    ///
    /// `q`, `k`, and `v` must share the `(heads, set, head_dim)` shape, the
    /// same device, and the same float dtype. Attention-weight dropout is
    /// applied only when `train` is set and `config.dropout_p` is positive.
    /// The output keeps the input shape and dtype.
    pub fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &Config,
        train: bool,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::exact init dropout_p={:?} scale={:?}",
                config.dropout_p,
                config.scale
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        if !q.is_contiguous() || !k.is_contiguous() || !v.is_contiguous() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must be contiguous in memory".to_string(),
            });
        }

        let (heads, set, head_dim) = q.dims3().map_err(|_| AttentionError::InvalidShape {
            context: "q must have shape [heads, set, head_dim]".to_string(),
        })?;
        let (kh, ks, kd) = k.dims3().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [heads, set, head_dim]".to_string(),
        })?;
        let (vh, vs, vd) = v.dims3().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [heads, set, head_dim]".to_string(),
        })?;
        if (kh, ks, kd) != (heads, set, head_dim) || (vh, vs, vd) != (heads, set, head_dim) {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "expected matching shapes [{heads}, {set}, {head_dim}], got k {:?} v {:?}",
                    k.dims(),
                    v.dims()
                ),
            });
        }
        if set == 0 {
            return Err(AttentionError::InvalidShape {
                context: "image set must be non-empty".to_string(),
            });
        }

        let (q_work, k_work, v_work) = if dtype == DType::F32 {
            (q.clone(), k.clone(), v.clone())
        } else {
            (
                q.to_dtype(DType::F32).map_err(AttentionError::backend)?,
                k.to_dtype(DType::F32).map_err(AttentionError::backend)?,
                v.to_dtype(DType::F32).map_err(AttentionError::backend)?,
            )
        };

        let k_t = k_work.transpose(1, 2).map_err(AttentionError::backend)?;
        let scale = config.effective_scale(head_dim);
        let scores = q_work
            .matmul(&k_t.contiguous().map_err(AttentionError::backend)?)
            .map_err(AttentionError::backend)?
            .affine(f64::from(scale), 0.0)
            .map_err(AttentionError::backend)?;

        let probs = softmax_last_dim(&scores).map_err(AttentionError::backend)?;

        let probs = match config.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => {
                return Err(AttentionError::InvalidShape {
                    context: format!("dropout probability must be in [0, 1), got {p}"),
                });
            }
            Some(p) if train && p > 0.0 => {
                dropout(&probs, p).map_err(AttentionError::backend)?
            }
            _ => probs,
        };

        let output = probs.matmul(&v_work).map_err(AttentionError::backend)?;
        output.to_dtype(dtype).map_err(AttentionError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..48).map(|i| (i as f32) * 0.01 - 0.2).collect();
        let q = Tensor::from_vec(data.clone(), (2, 3, 8), device)?;
        let k = Tensor::from_vec(
            data.iter().map(|v| v * 0.7 + 0.05).collect::<Vec<_>>(),
            (2, 3, 8),
            device,
        )?;
        let v = Tensor::from_vec(
            data.iter().map(|v| v * -1.3).collect::<Vec<_>>(),
            (2, 3, 8),
            device,
        )?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        scale: f32,
    ) -> CandleResult<Tensor> {
        let (heads, set, head_dim) = q.dims3()?;
        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut output = vec![0f32; heads * set * head_dim];

        for h in 0..heads {
            for qi in 0..set {
                let mut row = vec![0f32; set];
                let mut max_val = f32::NEG_INFINITY;
                for ki in 0..set {
                    let mut dot = 0f32;
                    for d in 0..head_dim {
                        dot += q_vec[(h * set + qi) * head_dim + d]
                            * k_vec[(h * set + ki) * head_dim + d];
                    }
                    let scored = dot * scale;
                    row[ki] = scored;
                    if scored > max_val {
                        max_val = scored;
                    }
                }
                let mut denom = 0f32;
                for val in row.iter_mut() {
                    *val = (*val - max_val).exp();
                    denom += *val;
                }
                for d in 0..head_dim {
                    let mut acc = 0f32;
                    for ki in 0..set {
                        acc += (row[ki] / denom) * v_vec[(h * set + ki) * head_dim + d];
                    }
                    output[(h * set + qi) * head_dim + d] = acc;
                }
            }
        }

        Tensor::from_vec(output, (heads, set, head_dim), q.device())
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::new();
        let config = Config::default();
        let output = attention.attend(&q, &k, &v, &config, false).unwrap();
        let expected = naive_attention(&q, &k, &v, config.effective_scale(8))?;
        let diff = output
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn scale_override_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = Config {
            scale: Some(0.01),
            ..Config::default()
        };
        let output = ExactAttention::new()
            .attend(&q, &k, &v, &config, false)
            .unwrap();
        let expected = naive_attention(&q, &k, &v, 0.01)?;
        let diff = output
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn single_image_set_attends_to_itself() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 1, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 1, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 1, 4), &device)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap();
        // With one key the softmax weight is 1, so the output equals v.
        let diff = output.sub(&v)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn empty_set_errors() {
        let device = Device::Cpu;
        let q = Tensor::zeros((2, 0, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((2, 0, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((2, 0, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn integer_dtype_is_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4), DType::U32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4), DType::U32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4), DType::U32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap();
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    &Config::default(),
                    false,
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let diff = out
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            assert!(diff < 5e-2, "dtype {dtype:?} diverged by {diff}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability_with_large_scores() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn dropout_is_inert_outside_training() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = Config {
            dropout_p: Some(0.5),
            ..Config::default()
        };
        let out = ExactAttention::new()
            .attend(&q, &k, &v, &config, false)
            .unwrap();
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap();
        let diff = out.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn invalid_dropout_probability_errors() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let config = Config {
            dropout_p: Some(1.5),
            ..Config::default()
        };
        let err = ExactAttention::new()
            .attend(&q, &q, &q, &config, true)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn attention_rows_sum_to_one_through_uniform_values() -> CandleResult<()> {
        // With identical value vectors the output must equal that vector
        // regardless of the attention distribution.
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 5, 4), &device)?;
        let v = Tensor::ones((2, 5, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, &Config::default(), false)
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| (value - 1.0).abs() < 1e-5));
        Ok(())
    }
}
