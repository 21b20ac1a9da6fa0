//! Graph-level classifier head fed by per-node embeddings.
//!
//! Each node contributes its embedding followed by its leading raw features (which skip the
//! embedding). The rows of one graph are laid side by side and fed through
//! `fc1 -> dropout -> elu -> fc3`.

use candle_core::Tensor;
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::error::{Error, Result};
use crate::graph::check_batch_divides;

#[derive(Debug, Clone)]
pub struct ClassifierHead {
    fc1: Linear,
    fc3: Linear,
    dropout: Dropout,
    embed_width: usize,
    raw_features: usize,
    nodes_per_graph: usize,
}

impl ClassifierHead {
    /// `fc1` takes `nodes_per_graph · (embed_width + raw_features)` inputs.
    pub fn new(
        embed_width: usize,
        raw_features: usize,
        nodes_per_graph: usize,
        hidden: usize,
        num_classes: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let graph_width = nodes_per_graph * (embed_width + raw_features);
        Ok(Self {
            fc1: candle_nn::linear(graph_width, hidden, vb.pp("fc1"))?,
            fc3: candle_nn::linear(hidden, num_classes, vb.pp("fc3"))?,
            dropout: Dropout::new(dropout),
            embed_width,
            raw_features,
            nodes_per_graph,
        })
    }

    /// `[embedded ‖ x[:, ..raw_features]]`, one row per node.
    pub fn node_rows(&self, embedded: &Tensor, x: &Tensor) -> Result<Tensor> {
        let (n, width) = embedded.dims2()?;
        if width != self.embed_width {
            return Err(Error::shape("node embedding width", self.embed_width, width));
        }
        let (xn, features) = x.dims2()?;
        if xn != n || features < self.raw_features {
            return Err(Error::shape(
                "raw node features",
                (n, format!(">= {}", self.raw_features)),
                (xn, features),
            ));
        }
        let raw = x.narrow(1, 0, self.raw_features)?.to_dtype(embedded.dtype())?;
        Ok(Tensor::cat(&[embedded, &raw], 1)?)
    }

    /// Returns `(logits (B, num_classes), reg)`. `reg` is always a zero of shape `(1,)`.
    pub fn forward_t(
        &self,
        embedded: &Tensor,
        x: &Tensor,
        batch_size: usize,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let rows = self.node_rows(embedded, x)?;
        let grouped = group_by_graph(&rows, batch_size)?;
        let expected = self.nodes_per_graph * (self.embed_width + self.raw_features);
        if grouped.dim(1)? != expected {
            return Err(Error::shape("per-graph input width", expected, grouped.dim(1)?));
        }

        let h = self.fc1.forward(&grouped)?;
        let h = self.dropout.forward(&h, train)?.elu(1.0)?;
        let logits = self.fc3.forward(&h)?;
        let reg = Tensor::zeros(1, logits.dtype(), logits.device())?;
        Ok((logits, reg))
    }
}

/// Lays the rows of each graph side by side: `(N, W) -> (B, N/B · W)`.
///
/// Row-major, so node `i` lands in graph `i / (N / B)`.
pub fn group_by_graph(nodes: &Tensor, batch_size: usize) -> Result<Tensor> {
    let (n, width) = nodes.dims2()?;
    check_batch_divides(n, batch_size)?;
    Ok(nodes.reshape((batch_size, n / batch_size * width))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn head(embed_width: usize, nodes_per_graph: usize, dropout: f32) -> ClassifierHead {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        ClassifierHead::new(embed_width, 7, nodes_per_graph, 6, 2, dropout, vb).unwrap()
    }

    #[test]
    fn grouping_keeps_nodes_with_their_graph() {
        let dev = Device::Cpu;
        // Row i holds [i, i + 0.5].
        let values: Vec<f32> = (0..12).flat_map(|i| [i as f32, i as f32 + 0.5]).collect();
        let nodes = Tensor::from_vec(values, (12, 2), &dev).unwrap();

        let grouped = group_by_graph(&nodes, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(grouped.len(), 3);
        for (g, row) in grouped.iter().enumerate() {
            assert_eq!(row.len(), 8);
            for (k, chunk) in row.chunks(2).enumerate() {
                let node = g * 4 + k;
                assert_eq!(node / 4, g);
                assert_eq!(chunk, &[node as f32, node as f32 + 0.5]);
            }
        }
    }

    #[test]
    fn grouping_rejects_uneven_batches() {
        let nodes = Tensor::zeros((10, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            group_by_graph(&nodes, 3),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn node_rows_put_embedding_first() {
        let dev = Device::Cpu;
        let h = head(2, 1, 0.0);
        let embedded = Tensor::new(&[[10f32, 11.]], &dev).unwrap();
        let x = Tensor::new(&[[0f32, 1., 2., 3., 4., 5., 6., 7., 8.]], &dev).unwrap();
        let rows = h.node_rows(&embedded, &x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![10., 11., 0., 1., 2., 3., 4., 5., 6.]);
    }

    #[test]
    fn logits_per_graph_and_zero_reg() {
        let dev = Device::Cpu;
        let h = head(3, 4, 0.0);
        let embedded = Tensor::randn(0f32, 1.0, (12, 3), &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (12, 9), &dev).unwrap();

        let (logits, reg) = h.forward_t(&embedded, &x, 3, false).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);
        assert_eq!(reg.to_vec1::<f32>().unwrap(), vec![0.0]);
    }

    #[test]
    fn wrong_nodes_per_graph_is_rejected() {
        let dev = Device::Cpu;
        let h = head(3, 4, 0.0);
        let embedded = Tensor::randn(0f32, 1.0, (12, 3), &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (12, 9), &dev).unwrap();
        assert!(matches!(
            h.forward_t(&embedded, &x, 2, false),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn dropout_only_applies_in_training() {
        let dev = Device::Cpu;
        let plain = head(3, 4, 0.0);
        let embedded = Tensor::randn(0f32, 1.0, (8, 3), &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (8, 9), &dev).unwrap();
        let dropped = ClassifierHead {
            dropout: Dropout::new(0.5),
            ..plain.clone()
        };

        let a = plain.forward_t(&embedded, &x, 2, false).unwrap().0;
        let b = dropped.forward_t(&embedded, &x, 2, false).unwrap().0;
        assert_eq!(
            a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }
}
