//! Graph classifiers assembled from an embedding and a [`ClassifierHead`].
//!
//! Both models split node features into `raw_features` leading columns, which go straight to
//! the head, and the remaining columns, which are embedded first.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use tracing::debug;

use crate::config::ModelConfig;
use crate::egat::EGATConv;
use crate::error::{Error, Result};
use crate::graph::Batch;
use crate::head::ClassifierHead;
use crate::nn::EdgeConv;

/// The columns after the raw prefix.
fn embedded_columns(x: &Tensor, cfg: &ModelConfig) -> Result<Tensor> {
    let width = x.dim(1)?;
    if width != cfg.num_features {
        return Err(Error::shape("node feature width", cfg.num_features, width));
    }
    Ok(x.narrow(1, cfg.raw_features, cfg.embedded_features())?)
}

/// Per-node linear embedding to a single value; ignores graph structure.
#[derive(Debug, Clone)]
pub struct Baseline {
    cfg: ModelConfig,
    emb: Linear,
    head: ClassifierHead,
}

impl Baseline {
    pub fn new(cfg: ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let emb = candle_nn::linear(cfg.embedded_features(), 1, vb.pp("emb1"))?;
        let head = ClassifierHead::new(
            1,
            cfg.raw_features,
            cfg.nodes_per_graph(),
            cfg.hidden,
            cfg.num_classes,
            cfg.dropout,
            vb,
        )?;
        Ok(Self { cfg, emb, head })
    }

    /// `(logits (B, num_classes), reg)`.
    pub fn forward_t(&self, batch: &Batch, train: bool) -> Result<(Tensor, Tensor)> {
        let x = &batch.graph.x;
        let embedded = self.emb.forward(&embedded_columns(x, &self.cfg)?)?;
        self.head.forward_t(&embedded, x, batch.num_graphs(), train)
    }
}

/// Embeds node features with an [`EGATConv`] over the batch's edges before classifying.
#[derive(Debug, Clone)]
pub struct EgatClassifier {
    cfg: ModelConfig,
    conv: EGATConv,
    head: ClassifierHead,
}

impl EgatClassifier {
    /// Requires `cfg.conv`.
    pub fn new(cfg: ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let Some(conv_cfg) = cfg.conv.clone() else {
            return Err(Error::InvalidConfig(
                "EgatClassifier needs a `conv` section".into(),
            ));
        };
        let conv = EGATConv::new(conv_cfg, vb.pp("conv"))?;
        let head = ClassifierHead::new(
            conv.output_width(),
            cfg.raw_features,
            cfg.nodes_per_graph(),
            cfg.hidden,
            cfg.num_classes,
            cfg.dropout,
            vb,
        )?;
        debug!(conv = %conv, nodes_per_graph = cfg.nodes_per_graph(), "built egat classifier");
        Ok(Self { cfg, conv, head })
    }

    #[must_use]
    pub fn conv(&self) -> &EGATConv {
        &self.conv
    }

    /// `(logits (B, num_classes), reg)`.
    pub fn forward_t(&self, batch: &Batch, train: bool) -> Result<(Tensor, Tensor)> {
        let graph = &batch.graph;
        let tail = embedded_columns(&graph.x, &self.cfg)?;
        let embedded = self
            .conv
            .forward_t(&tail, &graph.edge_index, &graph.edge_attr, train)?
            .out;
        self.head
            .forward_t(&embedded, &graph.x, batch.num_graphs(), train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EgatConfig;
    use crate::graph::Graph;
    use candle_core::{DType, Device};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

    fn batch(num_graphs: usize, nodes: usize, features: usize) -> Batch {
        let dev = Device::Cpu;
        let graphs: Vec<Graph> = (0..num_graphs)
            .map(|_| {
                let x = Tensor::randn(0f32, 1.0, (nodes, features), &dev).unwrap();
                let edges: Vec<(u32, u32)> =
                    (0..nodes as u32).map(|i| (i, (i + 1) % nodes as u32)).collect();
                let attr = Tensor::rand(0.5f32, 1.5, nodes, &dev).unwrap();
                Graph::from_edges(x, &edges, attr).unwrap()
            })
            .collect();
        Batch::from_graphs(&graphs).unwrap()
    }

    fn model_config(conv: Option<EgatConfig>) -> ModelConfig {
        ModelConfig {
            num_nodes: 12,
            num_features: 10,
            batch_size: 3,
            raw_features: 7,
            hidden: 6,
            num_classes: 2,
            dropout: 0.1,
            conv,
        }
    }

    #[test]
    fn baseline_scores_each_graph() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Baseline::new(model_config(None), vb).unwrap();

        let (logits, reg) = model.forward_t(&batch(3, 4, 10), false).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);
        assert_eq!(reg.to_vec1::<f32>().unwrap(), vec![0.0]);
        // emb1 (w, b), fc1 (w, b), fc3 (w, b)
        assert_eq!(varmap.all_vars().len(), 6);
    }

    #[test]
    fn egat_classifier_scores_each_graph() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = EgatConfig::new(3, 2).with_heads(2);
        let model = EgatClassifier::new(model_config(Some(conv)), vb).unwrap();
        assert_eq!(model.conv().output_width(), 4);

        let (logits, _) = model.forward_t(&batch(3, 4, 10), false).unwrap();
        assert_eq!(logits.dims(), &[3, 2]);
    }

    #[test]
    fn egat_classifier_needs_conv_config() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            EgatClassifier::new(model_config(None), vb),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn feature_width_is_checked() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Baseline::new(model_config(None), vb).unwrap();
        assert!(matches!(
            model.forward_t(&batch(3, 4, 9), false),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn one_optimizer_step_updates_the_conv() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = EgatConfig::new(3, 2).with_heads(2);
        let model = EgatClassifier::new(model_config(Some(conv)), vb).unwrap();
        let data = batch(3, 4, 10);
        let target = Tensor::new(&[0u32, 1, 0], &Device::Cpu).unwrap();

        let before = model.conv().weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let mut opt = AdamW::new(varmap.all_vars(), ParamsAdamW::default()).unwrap();
        let (logits, reg) = model.forward_t(&data, true).unwrap();
        let loss = candle_nn::loss::cross_entropy(&logits, &target)
            .unwrap()
            .broadcast_add(&reg)
            .unwrap()
            .sum_all()
            .unwrap();
        opt.backward_step(&loss).unwrap();

        let after = model.conv().weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, after);
    }
}
