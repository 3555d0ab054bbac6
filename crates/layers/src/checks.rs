//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be
//! wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has the expected rank.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got rank {actual} with shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(set, hidden)` convention with a known hidden size.
///
/// The set axis must be non-empty: an empty image set has no tokens to
/// attend over.
pub fn expect_set_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [set, actual] if *actual == hidden && *set > 0 => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (set > 0, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks two tensors share the same dtype.
pub fn expect_same_dtype(
    left_name: &str,
    left: &Tensor,
    right_name: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_name} dtype {:?} does not match {right_name} dtype {:?}",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Ensures a tensor is laid out contiguously in memory.
pub fn expect_contiguous(name: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{name}: tensor must be contiguous")))
    }
}

/// Confirms a cast between the two dtypes is supported by the float paths.
pub fn ensure_cast_supported(name: &str, from: DType, to: DType) -> Result<()> {
    let float = |d: DType| matches!(d, DType::F16 | DType::BF16 | DType::F32 | DType::F64);
    if float(from) && float(to) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: unsupported cast {from:?} -> {to:?}"
        )))
    }
}
