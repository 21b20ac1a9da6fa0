//! Parameter initialization.

use candle_nn::Init;

/// Bound of the fan-in scaled uniform init: `1 / sqrt(size)`.
#[must_use]
pub fn uniform_bound(size: usize) -> f64 {
    1.0 / (size.max(1) as f64).sqrt()
}

/// `U(-b, b)` with `b = uniform_bound(size)`, for use with `VarBuilder::get_with_hints`.
#[must_use]
pub fn uniform(size: usize) -> Init {
    let bound = uniform_bound(size);
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}
