//! Additive application of keep masks.

use candle_core::{bail, DType, Result, Tensor};

/// Most negative finite value representable by `dtype`.
pub fn min_value_of_dtype(dtype: DType) -> Result<f64> {
    match dtype {
        DType::F64 => Ok(f64::MIN),
        DType::F32 => Ok(f64::from(f32::MIN)),
        DType::F16 => Ok(-65504.0),
        DType::BF16 => Ok(-3.389_531_389_251_535_5e38),
        other => bail!("masking requires a float dtype, got {other:?}"),
    }
}

/// Adds `(1 - keep) * min_value` to `values`.
///
/// `mask` is lifted to rank 4 by inserting singleton head (and query)
/// dimensions, then broadcast against `values`. An all-keep mask leaves
/// `values` numerically unchanged. The sum saturates at the dtype minimum, so
/// masking a tensor that already carries the penalty stays finite.
pub fn apply_mask(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = match mask.rank() {
        2 => mask.unsqueeze(1)?.unsqueeze(1)?,
        3 => mask.unsqueeze(1)?,
        4 => mask.clone(),
        rank => bail!(
            "mask must be shaped [batch, k], [batch, q, k] or [batch, h, q, k], got rank {rank}"
        ),
    };
    let dtype = values.dtype();
    let min_value = min_value_of_dtype(dtype)?;
    let keep = mask.ne(0f64)?.to_dtype(dtype)?;
    let penalty = keep.affine(-1.0, 1.0)?.affine(min_value, 0.0)?;
    values.broadcast_add(&penalty)?.maximum(min_value)
}
