//! Multi-dimensional edge-aware attention (softmax-normalized).
//!
//! One attention slice per edge attribute column `d`:
//!
//! ```text
//! s_ij^d     = softmax_{j -> i}(leaky_relu(a^d · [h_i^d ‖ h_j^d]))
//! alpha_ij^d = s_ij^d * e_ij^d / sum_d' |s_ij^d' * e_ij^d'|
//! out_i^d    = sum_j dropout(alpha_ij^d) * h_j^d
//! ```
//!
//! The layer works on the edge index as given; add self-loops upstream if they are wanted.

use std::fmt;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::MegatConfig;
use crate::diagnostics::{DiagnosticsCollector, Stage};
use crate::error::{Error, Result};
use crate::graph::{check_edge_attr, checked_edge_index};
use crate::nn::{record, split_edge_index, AttentionDims, ConvOutput, EdgeAttention, EdgeConv};
use crate::scatter::{l1_normalize, segment_softmax};

/// Edge-aware attention with one softmax-normalized slice per edge attribute dimension.
#[derive(Debug, Clone)]
pub struct MEGATConv {
    cfg: MegatConfig,
    attn: EdgeAttention,
}

impl MEGATConv {
    pub fn new(cfg: MegatConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let attn = EdgeAttention::new(dims(&cfg), vb)?;
        Ok(Self { cfg, attn })
    }

    /// Builds the layer around existing parameters: `weight (in, D·out)`,
    /// `att_weight (1, D, 2·out)`, `bias (D·out)` or `(out)`.
    pub fn from_parts(
        cfg: MegatConfig,
        weight: Tensor,
        att_weight: Tensor,
        bias: Option<Tensor>,
    ) -> Result<Self> {
        cfg.validate()?;
        let attn = EdgeAttention::from_parts(dims(&cfg), weight, att_weight, bias)?;
        Ok(Self { cfg, attn })
    }

    #[must_use]
    pub fn config(&self) -> &MegatConfig {
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

fn dims(cfg: &MegatConfig) -> AttentionDims {
    AttentionDims {
        in_channels: cfg.in_channels,
        out_channels: cfg.out_channels,
        slices: cfg.edge_attr_dim,
        concat: cfg.concat,
        bias: cfg.bias,
        negative_slope: cfg.negative_slope,
        dropout: cfg.dropout,
    }
}

/// The attribute as `(E, D)`; a 1-D attribute only fits a single dimension.
fn dim_attr(edge_attr: &Tensor, edge_attr_dim: usize) -> Result<Tensor> {
    match *edge_attr.dims() {
        [e] if edge_attr_dim == 1 => Ok(edge_attr.reshape((e, 1))?),
        [_, d] if d == edge_attr_dim => Ok(edge_attr.clone()),
        ref other => Err(Error::shape(
            "edge attributes",
            format!("(E, {edge_attr_dim})"),
            other,
        )),
    }
}

impl EdgeConv for MEGATConv {
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
        let attr = dim_attr(&edge_attr.to_dtype(h.dtype())?, self.attn.slices())?;
        let (row, col) = split_edge_index(&edge_index)?;
        let num_edges = row.dim(0)?;
        debug!(
            num_nodes,
            num_edges,
            edge_attr_dim = self.cfg.edge_attr_dim,
            train,
            "megat forward"
        );

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

        let alpha = segment_softmax(&alpha, &row, num_nodes)?;
        record(&mut diagnostics, Stage::Normalized, &alpha);

        // The attribute rescales each slice; renormalize per edge across slices.
        let alpha = l1_normalize(&alpha.mul(&attr)?, 1)?;
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

impl fmt::Display for MEGATConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MEGATConv({}, {}, edge_attr_dim={})",
            self.cfg.in_channels, self.cfg.out_channels, self.cfg.edge_attr_dim
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemoryCollector;
    use crate::graph::{add_self_loops, edge_rows, Graph};
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    fn flat(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn random_layer(cfg: MegatConfig) -> MEGATConv {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MEGATConv::new(cfg, vb).unwrap()
    }

    fn star_graph(edge_attr_dim: usize) -> Graph {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (5, 6), &dev).unwrap();
        // Node 0 receives from 1..=3, node 4 receives from 0; nodes 1..=3 receive nothing.
        let edges = [(0u32, 1u32), (0, 2), (0, 3), (4, 0)];
        let attr = Tensor::ones((4, edge_attr_dim), DType::F32, &dev).unwrap();
        Graph::from_edges(x, &edges, attr).unwrap()
    }

    #[test]
    fn softmax_over_incoming_edges_sums_to_one() {
        let layer = random_layer(MegatConfig::new(6, 3, 2));
        let graph = star_graph(2);
        let mut sink = MemoryCollector::new();
        layer
            .forward_with(&graph.x, &graph.edge_index, &graph.edge_attr, false, Some(&mut sink))
            .unwrap();

        let s = sink.get(Stage::Normalized)[0].to_vec2::<f32>().unwrap();
        for d in 0..2 {
            let into_0: f32 = s[..3].iter().map(|r| r[d]).sum();
            assert!((into_0 - 1.0).abs() < 1e-5, "dim {d}: {into_0}");
            assert!((s[3][d] - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn weights_are_l1_normalized_per_edge() {
        let dev = Device::Cpu;
        let layer = random_layer(MegatConfig::new(6, 3, 3));
        let graph = star_graph(3);
        let attr = Tensor::new(
            &[[1f32, 2., 0.5], [0.1, 0.1, 3.], [1., 1., 1.], [4., 0., 2.]],
            &dev,
        )
        .unwrap();

        let alpha = layer
            .forward(&graph.x, &graph.edge_index, &attr)
            .unwrap()
            .alpha
            .to_vec2::<f32>()
            .unwrap();
        for row in &alpha {
            let l1: f32 = row.iter().map(|v| v.abs()).sum();
            assert!((l1 - 1.0).abs() < 1e-5);
        }
        // A zero attribute zeroes that slice.
        assert_eq!(alpha[3][1], 0.0);
    }

    #[test]
    fn single_dimension_weights_collapse_to_one() {
        // With D = 1 the per-edge L1 normalization leaves |alpha| = 1 for every edge.
        let layer = random_layer(MegatConfig::new(6, 2, 1));
        let graph = star_graph(1);
        let attr = Tensor::new(&[0.2f32, 3.0, 1.0, 0.7], &Device::Cpu).unwrap();
        let alpha = flat(&layer.forward(&graph.x, &graph.edge_index, &attr).unwrap().alpha);
        assert!(alpha.iter().all(|a| (a - 1.0).abs() < 1e-5));
    }

    #[test]
    fn nodes_without_incoming_edges_are_zero() {
        let layer = random_layer(MegatConfig::new(6, 4, 2).with_bias(false));
        let graph = star_graph(2);
        let out = layer
            .forward_single(&graph, false)
            .unwrap()
            .out
            .to_vec2::<f32>()
            .unwrap();
        assert!(out.iter().flatten().all(|v| v.is_finite()));
        for node in 1..=3 {
            assert!(out[node].iter().all(|v| *v == 0.0), "node {node}");
        }
        assert!(out[0].iter().any(|v| *v != 0.0));
    }

    #[test]
    fn output_shapes_follow_concat() {
        let graph = star_graph(2);
        let cat = random_layer(MegatConfig::new(6, 4, 2));
        assert_eq!(cat.forward_single(&graph, false).unwrap().out.dims(), &[5, 8]);
        let mean = random_layer(MegatConfig::new(6, 4, 2).with_concat(false));
        assert_eq!(mean.forward_single(&graph, false).unwrap().out.dims(), &[5, 4]);
    }

    #[test]
    fn edge_index_is_used_as_given() {
        let layer = random_layer(MegatConfig::new(6, 2, 1));
        let graph = star_graph(1);
        let res = layer.forward_single(&graph, false).unwrap();
        assert_eq!(res.alpha.dims(), &[4, 1]);
        assert_eq!(
            edge_rows(&res.edge_index).unwrap(),
            edge_rows(&graph.edge_index).unwrap()
        );
    }

    #[test]
    fn upstream_self_loops_give_every_node_a_message() {
        let layer = random_layer(MegatConfig::new(6, 2, 2).with_bias(false));
        let graph = star_graph(2);
        let (ei, ea) = add_self_loops(&graph.edge_index, &graph.edge_attr, 5, 1.0).unwrap();
        let out = layer.forward(&graph.x, &ei, &ea).unwrap().out.to_vec2::<f32>().unwrap();
        assert!(out.iter().all(|row| row.iter().any(|v| *v != 0.0)));
    }

    #[test]
    fn attribute_width_must_match() {
        let layer = random_layer(MegatConfig::new(6, 2, 2));
        let graph = star_graph(3);
        assert!(matches!(
            layer.forward_single(&graph, false),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn dropout_is_identity_at_inference() {
        let base = random_layer(MegatConfig::new(6, 3, 2));
        let dropped = MEGATConv::from_parts(
            base.config().clone().with_dropout(0.3),
            base.weight().clone(),
            base.att_weight().clone(),
            base.bias().cloned(),
        )
        .unwrap();
        let graph = star_graph(2);
        let a = base.forward_single(&graph, false).unwrap();
        let b = dropped.forward_single(&graph, false).unwrap();
        assert_eq!(flat(&a.out), flat(&b.out));
    }

    #[test]
    fn training_dropout_applies_to_returned_alpha() {
        let dev = Device::Cpu;
        let layer = random_layer(MegatConfig::new(6, 3, 2).with_dropout(0.5));
        let n = 64u32;
        let x = Tensor::randn(0f32, 1.0, (n as usize, 6), &dev).unwrap();
        let edges: Vec<(u32, u32)> = (0..n).map(|i| (i, (i + 1) % n)).collect();
        let attr = Tensor::rand(0.1f32, 1.0, (n as usize, 2), &dev).unwrap();
        let graph = Graph::from_edges(x, &edges, attr).unwrap();

        let mut sink = MemoryCollector::new();
        let res = layer
            .forward_with(
                &graph.x,
                &graph.edge_index,
                &graph.edge_attr,
                true,
                Some(&mut sink),
            )
            .unwrap();
        let weights = flat(&sink.get(Stage::Weights)[0]);
        let alpha = flat(&res.alpha);
        assert_eq!(alpha.len(), weights.len());

        let mut dropped = 0;
        for (a, w) in alpha.iter().zip(&weights) {
            if *a == 0.0 {
                dropped += 1;
            } else {
                assert!((a - 2.0 * w).abs() < 1e-5, "kept weight {w} returned as {a}");
            }
        }
        assert!(dropped > 0 && dropped < alpha.len());
        assert_ne!(alpha, weights);
    }

    #[test]
    fn gradients_reach_parameters() {
        let base = random_layer(MegatConfig::new(6, 2, 2));
        let weight = Var::from_tensor(base.weight()).unwrap();
        let att = Var::from_tensor(base.att_weight()).unwrap();
        let layer = MEGATConv::from_parts(
            base.config().clone(),
            weight.as_tensor().clone(),
            att.as_tensor().clone(),
            base.bias().cloned(),
        )
        .unwrap();

        let graph = star_graph(2);
        let out = layer.forward_single(&graph, false).unwrap().out;
        let grads = out.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        for t in [weight.as_tensor(), att.as_tensor()] {
            let g = grads.get(t).expect("missing gradient");
            assert!(flat(g).iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn display_names_the_shape() {
        let layer = random_layer(MegatConfig::new(6, 2, 3));
        assert_eq!(layer.to_string(), "MEGATConv(6, 2, edge_attr_dim=3)");
    }
}
