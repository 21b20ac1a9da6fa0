//! The attention kernel shared by the edge-aware convolutions.
//!
//! Both layers project nodes into `S` parallel slices (heads for [`EGATConv`], edge attribute
//! columns for [`MEGATConv`]), score every edge from its two endpoint projections, and sum the
//! weighted source projections into the target node. They differ only in how the raw scores are
//! turned into weights.
//!
//! [`EGATConv`]: crate::EGATConv
//! [`MEGATConv`]: crate::MEGATConv

use candle_core::{DType, Tensor, D};
use candle_nn::{ops, Dropout, VarBuilder};

use crate::diagnostics::{DiagnosticsCollector, Stage};
use crate::error::{Error, Result};
use crate::graph::{edge_rows, node_matrix, Batch, Graph};
use crate::init;
use crate::scatter::scatter_add;

/// What a forward pass returns.
#[derive(Debug, Clone)]
pub struct ConvOutput {
    /// Aggregated node features, `(N, S·F_out)` when concatenating, `(N, F_out)` otherwise.
    pub out: Tensor,
    /// Edge index the coefficients refer to (with self-loops, if the layer added them).
    pub edge_index: Tensor,
    /// Final per-edge coefficients after dropout, `(E, S)`.
    pub alpha: Tensor,
}

/// A graph convolution that weighs edges by their attributes.
pub trait EdgeConv {
    /// Runs the layer. `train` enables dropout; `diagnostics` receives intermediate tensors.
    fn forward_with(
        &self,
        x: &Tensor,
        edge_index: &Tensor,
        edge_attr: &Tensor,
        train: bool,
        diagnostics: Option<&mut dyn DiagnosticsCollector>,
    ) -> Result<ConvOutput>;

    /// Width of one output row.
    fn output_width(&self) -> usize;

    /// Forward pass without diagnostics; `train` enables dropout.
    fn forward_t(
        &self,
        x: &Tensor,
        edge_index: &Tensor,
        edge_attr: &Tensor,
        train: bool,
    ) -> Result<ConvOutput> {
        self.forward_with(x, edge_index, edge_attr, train, None)
    }

    /// Inference-mode forward pass.
    fn forward(&self, x: &Tensor, edge_index: &Tensor, edge_attr: &Tensor) -> Result<ConvOutput> {
        self.forward_t(x, edge_index, edge_attr, false)
    }

    /// Runs the layer over one [`Graph`].
    fn forward_single(&self, graph: &Graph, train: bool) -> Result<ConvOutput> {
        self.forward_t(&graph.x, &graph.edge_index, &graph.edge_attr, train)
    }

    /// Runs every graph of the batch in one pass over the merged graph. Output rows keep the
    /// batch's node order.
    fn forward_batch(&self, batch: &Batch, train: bool) -> Result<ConvOutput> {
        self.forward_single(&batch.graph, train)
    }
}

/// Learned parameters and hyper-parameters of one attention layer.
#[derive(Debug, Clone)]
pub(crate) struct EdgeAttention {
    /// `(F_in, S·F_out)`.
    pub(crate) weight: Tensor,
    /// `(1, S, 2·F_out)`, target half first.
    pub(crate) att_weight: Tensor,
    pub(crate) bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    slices: usize,
    concat: bool,
    negative_slope: f64,
    dropout: Dropout,
}

/// Shape-level description used to build an [`EdgeAttention`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttentionDims {
    pub in_channels: usize,
    pub out_channels: usize,
    pub slices: usize,
    pub concat: bool,
    pub bias: bool,
    pub negative_slope: f64,
    pub dropout: f32,
}

impl AttentionDims {
    fn bias_width(&self) -> usize {
        if self.concat {
            self.slices * self.out_channels
        } else {
            self.out_channels
        }
    }
}

/// Per-edge gather of the projected endpoints.
pub(crate) struct EdgeScores {
    /// Projected source nodes, `(E, S, F_out)`.
    pub sources: Tensor,
    /// `[x_target ‖ x_source] * att_weight`, `(E, S, 2·F_out)`.
    pub scores: Tensor,
}

impl EdgeAttention {
    /// Allocates `weight`, `att_weight` and `bias` under `vb`, all `U(-b, b)` with
    /// `b = 1 / sqrt(S·F_in)`.
    pub(crate) fn new(dims: AttentionDims, vb: VarBuilder) -> Result<Self> {
        let init = init::uniform(dims.slices * dims.in_channels);
        let weight = vb.get_with_hints(
            (dims.in_channels, dims.slices * dims.out_channels),
            "weight",
            init,
        )?;
        let att_weight =
            vb.get_with_hints((1, dims.slices, 2 * dims.out_channels), "att_weight", init)?;
        let bias = if dims.bias {
            Some(vb.get_with_hints(dims.bias_width(), "bias", init)?)
        } else {
            None
        };
        Ok(Self::assemble(dims, weight, att_weight, bias))
    }

    /// Wraps existing parameter tensors after checking their shapes.
    pub(crate) fn from_parts(
        dims: AttentionDims,
        weight: Tensor,
        att_weight: Tensor,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        let expected = [dims.in_channels, dims.slices * dims.out_channels];
        if weight.dims() != expected {
            return Err(Error::shape("projection weight", expected, weight.dims()));
        }
        let expected = [1, dims.slices, 2 * dims.out_channels];
        if att_weight.dims() != expected {
            return Err(Error::shape("attention weight", expected, att_weight.dims()));
        }
        match (&bias, dims.bias) {
            (Some(b), true) if b.dims() == [dims.bias_width()] => {}
            (None, false) => {}
            (b, _) => {
                return Err(Error::shape(
                    "bias",
                    dims.bias.then(|| [dims.bias_width()]),
                    b.as_ref().map(|b| b.dims().to_vec()),
                ))
            }
        }
        Ok(Self::assemble(dims, weight, att_weight, bias))
    }

    fn assemble(
        dims: AttentionDims,
        weight: Tensor,
        att_weight: Tensor,
        bias: Option<Tensor>,
    ) -> Self {
        Self {
            weight,
            att_weight,
            bias,
            in_channels: dims.in_channels,
            out_channels: dims.out_channels,
            slices: dims.slices,
            concat: dims.concat,
            negative_slope: dims.negative_slope,
            dropout: Dropout::new(dims.dropout),
        }
    }

    pub(crate) fn slices(&self) -> usize {
        self.slices
    }

    pub(crate) fn dtype(&self) -> DType {
        self.weight.dtype()
    }

    /// `x · W` viewed as `(N, S, F_out)`. No bias.
    pub(crate) fn project(&self, x: &Tensor) -> Result<Tensor> {
        let x = node_matrix(x)?;
        let (n, width) = x.dims2()?;
        if width != self.in_channels {
            return Err(Error::shape("node feature width", self.in_channels, width));
        }
        let h = x.to_dtype(self.dtype())?.matmul(&self.weight)?;
        Ok(h.reshape((n, self.slices, self.out_channels))?)
    }

    /// Gathers both endpoints of every edge and multiplies their concatenation by the attention
    /// vector.
    pub(crate) fn edge_scores(&self, h: &Tensor, row: &Tensor, col: &Tensor) -> Result<EdgeScores> {
        let targets = h.index_select(row, 0)?;
        let sources = h.index_select(col, 0)?;
        let scores = Tensor::cat(&[&targets, &sources], D::Minus1)?.broadcast_mul(&self.att_weight)?;
        Ok(EdgeScores { sources, scores })
    }

    /// `leaky_relu(sum(scores, -1))`, `(E, S)`.
    pub(crate) fn logits(&self, scores: &Tensor) -> Result<Tensor> {
        Ok(ops::leaky_relu(&scores.sum(D::Minus1)?, self.negative_slope)?)
    }

    pub(crate) fn dropout(&self, alpha: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.dropout.forward(alpha, train)?)
    }

    /// `scatter_add(alpha[:, :, None] * sources, row)`, then the slice policy and bias.
    pub(crate) fn aggregate(
        &self,
        sources: &Tensor,
        alpha: &Tensor,
        row: &Tensor,
        num_nodes: usize,
    ) -> Result<Tensor> {
        let messages = sources.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)?;
        let summed = scatter_add(&messages, row, num_nodes)?;
        self.finish(summed)
    }

    /// Output for a graph without a single edge: every node aggregates nothing.
    pub(crate) fn edgeless(&self, h: &Tensor) -> Result<(Tensor, Tensor)> {
        let alpha = Tensor::zeros((0, self.slices), h.dtype(), h.device())?;
        let out = self.finish(h.zeros_like()?)?;
        Ok((out, alpha))
    }

    fn finish(&self, summed: Tensor) -> Result<Tensor> {
        let n = summed.dim(0)?;
        let out = if self.concat {
            summed.reshape((n, self.slices * self.out_channels))?
        } else {
            summed.mean(1)?
        };
        match &self.bias {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }
}

/// Splits a checked `(2, E)` edge index into contiguous `(row, col)` index tensors.
pub(crate) fn split_edge_index(edge_index: &Tensor) -> Result<(Tensor, Tensor)> {
    let (rows, cols) = edge_rows(edge_index)?;
    let device = edge_index.device();
    let row = Tensor::from_vec(rows, edge_index.dim(1)?, device)?;
    let col = Tensor::from_vec(cols, edge_index.dim(1)?, device)?;
    Ok((row, col))
}

pub(crate) fn record(
    sink: &mut Option<&mut dyn DiagnosticsCollector>,
    stage: Stage,
    tensor: &Tensor,
) {
    if let Some(sink) = sink.as_mut() {
        sink.append(stage, tensor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn dims(slices: usize, concat: bool, bias: bool) -> AttentionDims {
        AttentionDims {
            in_channels: 3,
            out_channels: 2,
            slices,
            concat,
            bias,
            negative_slope: 0.2,
            dropout: 0.0,
        }
    }

    #[test]
    fn parameters_have_documented_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = EdgeAttention::new(dims(4, false, true), vb).unwrap();
        assert_eq!(attn.weight.dims(), &[3, 8]);
        assert_eq!(attn.att_weight.dims(), &[1, 4, 4]);
        assert_eq!(attn.bias.as_ref().unwrap().dims(), &[2]);
        assert_eq!(varmap.all_vars().len(), 3);
    }

    #[test]
    fn projection_rejects_wrong_width() {
        let dev = Device::Cpu;
        let attn = EdgeAttention::from_parts(
            dims(1, true, false),
            Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros((1, 1, 4), DType::F32, &dev).unwrap(),
            None,
        )
        .unwrap();
        let x = Tensor::zeros((5, 4), DType::F32, &dev).unwrap();
        assert!(matches!(attn.project(&x), Err(Error::ShapeMismatch { .. })));
        let x = Tensor::zeros((5, 3), DType::F32, &dev).unwrap();
        assert_eq!(attn.project(&x).unwrap().dims(), &[5, 1, 2]);
    }

    #[test]
    fn from_parts_checks_attention_and_bias() {
        let dev = Device::Cpu;
        let w = Tensor::zeros((3, 4), DType::F32, &dev).unwrap();
        let bad_att = Tensor::zeros((1, 2, 2), DType::F32, &dev).unwrap();
        assert!(EdgeAttention::from_parts(dims(2, true, false), w.clone(), bad_att, None).is_err());

        let att = Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap();
        let short_bias = Tensor::zeros(2, DType::F32, &dev).unwrap();
        assert!(
            EdgeAttention::from_parts(dims(2, true, true), w.clone(), att.clone(), Some(short_bias))
                .is_err()
        );
        assert!(EdgeAttention::from_parts(dims(2, true, true), w, att, None).is_err());
    }
}
