//! Edge-gated graph attention (independent heads, no softmax).
//!
//! For an edge from source `j` into target `i`, with `h = x · W` split into `H` heads:
//!
//! ```text
//! alpha_ij = leaky_relu(a · [h_i ‖ h_j]) * e_ij
//! out_i    = sum_j dropout(alpha_ij) * h_j
//! ```
//!
//! The edge attribute gates the logit directly rather than competing in a softmax, so its
//! magnitude sets the message strength regardless of the target's in-degree.

use std::fmt;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::EgatConfig;
use crate::diagnostics::{DiagnosticsCollector, Stage};
use crate::error::{Error, Result};
use crate::graph::{add_self_loops, check_edge_attr, checked_edge_index};
use crate::nn::{record, split_edge_index, AttentionDims, ConvOutput, EdgeAttention, EdgeConv};

/// Edge-aware graph attention layer with `heads` independent attention heads.
#[derive(Debug, Clone)]
pub struct EGATConv {
    cfg: EgatConfig,
    attn: EdgeAttention,
}

impl EGATConv {
    /// Creates the layer, registering `weight`, `att_weight` and (optionally) `bias` in `vb`.
    pub fn new(cfg: EgatConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let attn = EdgeAttention::new(dims(&cfg), vb)?;
        Ok(Self { cfg, attn })
    }

    /// Builds the layer around existing parameters.
    ///
    /// `weight` is `(in, heads·out)`, `att_weight` is `(1, heads, 2·out)` with the target half
    /// first, `bias` is `(heads·out)` when concatenating and `(out)` otherwise.
    pub fn from_parts(
        cfg: EgatConfig,
        weight: Tensor,
        att_weight: Tensor,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        cfg.validate()?;
        let attn = EdgeAttention::from_parts(dims(&cfg), weight, att_weight, bias)?;
        Ok(Self { cfg, attn })
    }

    #[must_use]
    pub fn config(&self) -> &EgatConfig {
        &self.cfg
    }

    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.attn.weight
    }

    #[must_use]
    pub fn att_weight(&self) -> &Tensor {
        &self.attn.att_weight
    }

    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.attn.bias.as_ref()
    }
}

fn dims(cfg: &EgatConfig) -> AttentionDims {
    AttentionDims {
        in_channels: cfg.in_channels,
        out_channels: cfg.out_channels,
        slices: cfg.heads,
        concat: cfg.concat,
        bias: cfg.bias,
        negative_slope: cfg.negative_slope,
        dropout: cfg.dropout,
    }
}

/// Views the attribute as `(E, 1)` or `(E, heads)` so it broadcasts over the head axis.
fn head_attr(edge_attr: &Tensor, heads: usize) -> Result<Tensor> {
    match *edge_attr.dims() {
        [e] => Ok(edge_attr.reshape((e, 1))?),
        [_, k] if k == 1 || k == heads => Ok(edge_attr.clone()),
        ref other => Err(Error::shape(
            "edge attributes",
            format!("(E,), (E, 1) or (E, {heads})"),
            other,
        )),
    }
}

impl EdgeConv for EGATConv {
    fn forward_with(
        &self,
        x: &Tensor,
        edge_index: &Tensor,
        edge_attr: &Tensor,
        train: bool,
        mut diagnostics: Option<&mut dyn DiagnosticsCollector>,
    ) -> Result<ConvOutput> {
        let h = self.attn.project(x)?;
        let num_nodes = h.dim(0)?;
        let edge_index = checked_edge_index(edge_index, num_nodes)?;
        check_edge_attr(edge_attr, edge_index.dim(1)?)?;
        let edge_attr = edge_attr.to_dtype(h.dtype())?;

        let (edge_index, edge_attr) = if self.cfg.add_self_loops {
            add_self_loops(&edge_index, &edge_attr, num_nodes, self.cfg.self_loop_fill)?
        } else {
            (edge_index, edge_attr)
        };
        let gate = head_attr(&edge_attr, self.cfg.heads)?;
        let (row, col) = split_edge_index(&edge_index)?;
        let num_edges = row.dim(0)?;
        debug!(num_nodes, num_edges, heads = self.cfg.heads, train, "egat forward");

        if num_edges == 0 {
            let (out, alpha) = self.attn.edgeless(&h)?;
            return Ok(ConvOutput {
                out,
                edge_index,
                alpha,
            });
        }

        let scored = self.attn.edge_scores(&h, &row, &col)?;
        record(&mut diagnostics, Stage::Scores, &scored.scores);
        let alpha = self.attn.logits(&scored.scores)?;
        record(&mut diagnostics, Stage::Logits, &alpha);

        let alpha = alpha.broadcast_mul(&gate)?;
        record(&mut diagnostics, Stage::Weights, &alpha);
        record(&mut diagnostics, Stage::EdgeIndex, &edge_index);

        let alpha = self.attn.dropout(&alpha, train)?;
        let out = self.attn.aggregate(&scored.sources, &alpha, &row, num_nodes)?;
        Ok(ConvOutput {
            out,
            edge_index,
            alpha,
        })
    }

    fn output_width(&self) -> usize {
        self.cfg.output_width()
    }
}

impl fmt::Display for EGATConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EGATConv({}, {}, heads={})",
            self.cfg.in_channels, self.cfg.out_channels, self.cfg.heads
        )
    }
}
