//! Burn-backed edge attention kernel (opt-in).
//!
//! This module mirrors the inference path of the candle layers on Burn tensors so trained
//! parameters can run on Burn backends (ndarray / wgpu / tch).
//!
//! Ownership: the candle layers in [`crate::egat`] and [`crate::megat`] remain the source of
//! truth. This module must be tested against them (see tests below). Self-loop augmentation and
//! dropout are not mirrored; pass the edge list the candle layer reports in `ConvOutput`.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::config::{EgatConfig, MegatConfig};

const SOFTMAX_EPS: f32 = 1e-16;
const L1_EPS: f32 = 1e-12;

/// Shape and activation settings of a [`BurnEdgeAttention`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurnAttentionDims {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Heads for EGAT, attribute dimensions for MEGAT.
    pub slices: usize,
    pub concat: bool,
    pub negative_slope: f64,
}

impl From<&EgatConfig> for BurnAttentionDims {
    fn from(cfg: &EgatConfig) -> Self {
        Self {
            in_channels: cfg.in_channels,
            out_channels: cfg.out_channels,
            slices: cfg.heads,
            concat: cfg.concat,
            negative_slope: cfg.negative_slope,
        }
    }
}

impl From<&MegatConfig> for BurnAttentionDims {
    fn from(cfg: &MegatConfig) -> Self {
        Self {
            in_channels: cfg.in_channels,
            out_channels: cfg.out_channels,
            slices: cfg.edge_attr_dim,
            concat: cfg.concat,
            negative_slope: cfg.negative_slope,
        }
    }
}

/// Attention parameters on a Burn backend. `S` slices (heads or attribute dims) of width `F`.
#[derive(Debug, Clone)]
pub struct BurnEdgeAttention<B: Backend> {
    /// `[F_in, S·F]`.
    weight: Tensor<B, 2>,
    /// `[1, S, F]`, applied to the target endpoint.
    att_target: Tensor<B, 3>,
    /// `[1, S, F]`, applied to the source endpoint.
    att_source: Tensor<B, 3>,
    bias: Option<Tensor<B, 1>>,
    slices: usize,
    out_channels: usize,
    concat: bool,
    negative_slope: f32,
}

impl<B: Backend> BurnEdgeAttention<B> {
    /// Builds the kernel from row-major parameter buffers laid out like the candle layer's
    /// `weight (F_in, S·F)`, `att_weight (1, S, 2F)` and `bias`.
    #[must_use]
    pub fn from_flat(
        weight: &[f32],
        att_weight: &[f32],
        bias: Option<&[f32]>,
        dims: BurnAttentionDims,
        device: &B::Device,
    ) -> Self {
        let (f, slices) = (dims.out_channels, dims.slices);
        let weight = Tensor::from_data(
            TensorData::new(weight.to_vec(), [dims.in_channels, slices * f]),
            device,
        );
        let att: Tensor<B, 3> =
            Tensor::from_data(TensorData::new(att_weight.to_vec(), [1, slices, 2 * f]), device);
        let att_target = att.clone().slice([0..1, 0..slices, 0..f]);
        let att_source = att.slice([0..1, 0..slices, f..2 * f]);
        let bias = bias.map(|b| Tensor::from_data(TensorData::new(b.to_vec(), [b.len()]), device));
        Self {
            weight,
            att_target,
            att_source,
            bias,
            slices,
            out_channels: f,
            concat: dims.concat,
            negative_slope: dims.negative_slope as f32,
        }
    }

    /// `x · W` as `[N, S, F]`.
    pub fn project(&self, x: Tensor<B, 2>) -> Tensor<B, 3> {
        let n = x.dims()[0];
        x.matmul(self.weight.clone())
            .reshape([n, self.slices, self.out_channels])
    }

    /// Edge-gated attention: `leaky_relu(a · [h_i ‖ h_j]) * e_ij`, no softmax.
    ///
    /// `edge_attr` is `[E, 1]` or `[E, S]`. Returns `(out, alpha)`.
    pub fn edge_gated(
        &self,
        x: Tensor<B, 2>,
        rows: &[u32],
        cols: &[u32],
        edge_attr: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self.project(x);
        let n = h.dims()[0];
        let (row, col) = (index::<B>(rows, &h.device()), index::<B>(cols, &h.device()));
        let (sources, logits) = self.logits(h, row.clone(), col);
        let alpha = logits * edge_attr;
        let out = self.aggregate(sources, alpha.clone(), row, n);
        (out, alpha)
    }

    /// Softmax-normalized attention: per-target softmax, times `edge_attr [E, S]`, then L1
    /// normalized across slices. Returns `(out, alpha)`.
    pub fn softmax_gated(
        &self,
        x: Tensor<B, 2>,
        rows: &[u32],
        cols: &[u32],
        edge_attr: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self.project(x);
        let n = h.dims()[0];
        let (row, col) = (index::<B>(rows, &h.device()), index::<B>(cols, &h.device()));
        let (sources, logits) = self.logits(h, row.clone(), col);
        let alpha = segment_softmax(logits, rows, n) * edge_attr;
        let norm = alpha.clone().abs().sum_dim(1).clamp_min(L1_EPS);
        let alpha = alpha / norm;
        let out = self.aggregate(sources, alpha.clone(), row, n);
        (out, alpha)
    }

    /// Gathered sources `[E, S, F]` and leaky-ReLU logits `[E, S]`.
    fn logits(
        &self,
        h: Tensor<B, 3>,
        row: Tensor<B, 1, Int>,
        col: Tensor<B, 1, Int>,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let targets = h.clone().select(0, row);
        let sources = h.select(0, col);
        let e = targets.dims()[0];
        // a · [h_i ‖ h_j] = a_t · h_i + a_s · h_j
        let raw = (targets * self.att_target.clone()).sum_dim(2)
            + (sources.clone() * self.att_source.clone()).sum_dim(2);
        let raw = raw.reshape([e, self.slices]);
        let logits = raw.clone().clamp_min(0.0) + raw.clamp_max(0.0) * self.negative_slope;
        (sources, logits)
    }

    fn aggregate(
        &self,
        sources: Tensor<B, 3>,
        alpha: Tensor<B, 2>,
        row: Tensor<B, 1, Int>,
        num_nodes: usize,
    ) -> Tensor<B, 2> {
        let [e, s, f] = sources.dims();
        let messages = sources * alpha.reshape([e, s, 1]);
        let summed = Tensor::<B, 3>::zeros([num_nodes, s, f], &messages.device())
            .select_assign(0, row, messages);
        let out = if self.concat {
            summed.reshape([num_nodes, s * f])
        } else {
            summed.mean_dim(1).reshape([num_nodes, f])
        };
        match &self.bias {
            Some(bias) => out + bias.clone().unsqueeze::<2>(),
            None => out,
        }
    }
}

fn index<B: Backend>(values: &[u32], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = values.iter().map(|&v| i64::from(v)).collect();
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [len]), device)
}

/// Per-segment softmax of `src [E, S]`, row `e` belonging to segment `segments[e]`.
///
/// Each segment is shifted by its own column max, read back on the host.
///
/// # Panics
///
/// If a segment id is `>= num_segments` or `segments` is shorter than `src`.
pub fn segment_softmax<B: Backend>(
    src: Tensor<B, 2>,
    segments: &[u32],
    num_segments: usize,
) -> Tensor<B, 2> {
    let [num_rows, s] = src.dims();
    if num_rows == 0 {
        return src;
    }
    let device = src.device();

    let values: Vec<f32> = src.to_data().iter::<f32>().collect();
    let mut max = vec![f32::NEG_INFINITY; num_segments * s];
    for (row, chunk) in values.chunks(s).enumerate() {
        let base = segments[row] as usize * s;
        for (slot, &v) in max[base..base + s].iter_mut().zip(chunk) {
            *slot = slot.max(v);
        }
    }
    for m in max.iter_mut().filter(|m| **m == f32::NEG_INFINITY) {
        *m = 0.0;
    }

    let row = index::<B>(&segments[..num_rows], &device);
    let shift = Tensor::<B, 2>::from_data(TensorData::new(max, [num_segments, s]), &device)
        .select(0, row.clone());
    let exp = (src - shift).exp();
    let sums = Tensor::<B, 2>::zeros([num_segments, s], &device)
        .select_assign(0, row.clone(), exp.clone());
    let denom = sums.select(0, row) + SOFTMAX_EPS;
    exp / denom
}
