//! Segment primitives over edge-indexed tensors.
//!
//! All three are composed from differentiable candle ops (`index_select`, `index_add`), so
//! gradients reach `src`. Summation order inside a segment is whatever `index_add` uses; results
//! are only reproducible up to floating-point reassociation.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

const SOFTMAX_EPS: f64 = 1e-16;
const L1_EPS: f64 = 1e-12;

/// Sums the rows of `src` into `dim_size` buckets along dim 0, bucket chosen by `index`.
///
/// Buckets that receive no rows stay zero.
pub fn scatter_add(src: &Tensor, index: &Tensor, dim_size: usize) -> Result<Tensor> {
    let num_rows = src.dim(0)?;
    if index.dims() != [num_rows] {
        return Err(Error::shape("scatter index", [num_rows], index.dims()));
    }
    let mut dims = src.dims().to_vec();
    dims[0] = dim_size;
    let out = Tensor::zeros(dims, src.dtype(), src.device())?;
    if num_rows == 0 {
        return Ok(out);
    }
    Ok(out.index_add(index, src, 0)?)
}

/// Softmax of `src` taken independently within every group of rows sharing an `index` value.
///
/// Trailing dimensions are independent: for `(E, D)` input each of the `D` columns is
/// normalized on its own. Groups with no rows produce nothing, so isolated nodes never see a
/// `0 / 0`.
pub fn segment_softmax(src: &Tensor, index: &Tensor, num_segments: usize) -> Result<Tensor> {
    let num_rows = src.dim(0)?;
    if index.dims() != [num_rows] {
        return Err(Error::shape("softmax index", [num_rows], index.dims()));
    }
    if num_rows == 0 {
        return Ok(src.clone());
    }

    // Per-segment max, computed on the host. Softmax is shift invariant, so the max is a
    // constant for the backward pass.
    let width: usize = src.dims()[1..].iter().product();
    let segments = index.to_vec1::<u32>()?;
    let values = src.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let mut max = vec![f32::NEG_INFINITY; num_segments * width];
    for (row, &segment) in segments.iter().enumerate() {
        let segment = segment as usize;
        if segment >= num_segments {
            return Err(Error::InvalidIndex {
                index: segment as i64,
                num_nodes: num_segments,
            });
        }
        for k in 0..width {
            let slot = &mut max[segment * width + k];
            *slot = slot.max(values[row * width + k]);
        }
    }
    for m in max.iter_mut().filter(|m| **m == f32::NEG_INFINITY) {
        *m = 0.0;
    }

    let mut segment_shape = src.dims().to_vec();
    segment_shape[0] = num_segments;
    let max = Tensor::from_vec(max, segment_shape, src.device())?.to_dtype(src.dtype())?;

    let exp = src.sub(&max.index_select(index, 0)?)?.exp()?;
    let denom = scatter_add(&exp, index, num_segments)?
        .index_select(index, 0)?
        .affine(1.0, SOFTMAX_EPS)?;
    Ok(exp.div(&denom)?)
}

/// `x / max(sum(|x|, dim), 1e-12)`.
pub fn l1_normalize(src: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = src.abs()?.sum_keepdim(dim)?.maximum(L1_EPS)?;
    Ok(src.broadcast_div(&norm)?)
}
