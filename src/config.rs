//! Layer and model configuration.
//!
//! Every optional field has a serde default, so a JSON config only needs the widths:
//!
//! ```
//! let cfg: egat::EgatConfig =
//!     serde_json::from_str(r#"{ "in_channels": 10, "out_channels": 4, "heads": 2 }"#).unwrap();
//! assert!(cfg.concat);
//! assert_eq!(cfg.negative_slope, 0.2);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_negative_slope() -> f64 {
    0.2
}

fn default_self_loop_fill() -> f64 {
    1.0
}

fn default_raw_features() -> usize {
    7
}

fn default_hidden() -> usize {
    6
}

fn default_num_classes() -> usize {
    2
}

/// Settings for [`EGATConv`](crate::EGATConv).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgatConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[serde(default = "default_one")]
    pub heads: usize,
    /// Concatenate heads (`true`) or average them.
    #[serde(default = "default_true")]
    pub concat: bool,
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f64,
    /// Dropout on the final attention coefficients, training only.
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_true")]
    pub bias: bool,
    /// Strip existing self-loops and add one per node before scoring.
    #[serde(default = "default_true")]
    pub add_self_loops: bool,
    /// Attribute value given to the added self-loops.
    #[serde(default = "default_self_loop_fill")]
    pub self_loop_fill: f64,
}

impl EgatConfig {
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            heads: 1,
            concat: true,
            negative_slope: default_negative_slope(),
            dropout: 0.0,
            bias: true,
            add_self_loops: true,
            self_loop_fill: default_self_loop_fill(),
        }
    }

    #[must_use]
    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    #[must_use]
    pub fn with_concat(mut self, concat: bool) -> Self {
        self.concat = concat;
        self
    }

    #[must_use]
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    #[must_use]
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    #[must_use]
    pub fn with_self_loops(mut self, add_self_loops: bool) -> Self {
        self.add_self_loops = add_self_loops;
        self
    }

    /// Width of one node's output row.
    #[must_use]
    pub fn output_width(&self) -> usize {
        if self.concat {
            self.heads * self.out_channels
        } else {
            self.out_channels
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_widths(self.in_channels, self.out_channels, self.heads, "heads")?;
        check_attention(self.negative_slope, self.dropout)
    }
}

/// Settings for [`MEGATConv`](crate::MEGATConv).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegatConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Number of edge attribute columns; one attention slice per column.
    #[serde(default = "default_one")]
    pub edge_attr_dim: usize,
    #[serde(default = "default_true")]
    pub concat: bool,
    #[serde(default = "default_negative_slope")]
    pub negative_slope: f64,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_true")]
    pub bias: bool,
}

impl MegatConfig {
    #[must_use]
    pub fn new(in_channels: usize, out_channels: usize, edge_attr_dim: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            edge_attr_dim,
            concat: true,
            negative_slope: default_negative_slope(),
            dropout: 0.0,
            bias: true,
        }
    }

    #[must_use]
    pub fn with_concat(mut self, concat: bool) -> Self {
        self.concat = concat;
        self
    }

    #[must_use]
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    #[must_use]
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    #[must_use]
    pub fn output_width(&self) -> usize {
        if self.concat {
            self.edge_attr_dim * self.out_channels
        } else {
            self.out_channels
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_widths(
            self.in_channels,
            self.out_channels,
            self.edge_attr_dim,
            "edge_attr_dim",
        )?;
        check_attention(self.negative_slope, self.dropout)
    }
}

/// Settings for the graph classifiers in [`models`](crate::models).
///
/// `num_nodes` counts the nodes of a whole batch, as a dataset reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub num_nodes: usize,
    pub num_features: usize,
    pub batch_size: usize,
    /// Leading node features that bypass the embedding.
    #[serde(default = "default_raw_features")]
    pub raw_features: usize,
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default)]
    pub dropout: f32,
    /// Embedding layer for [`EgatClassifier`](crate::models::EgatClassifier). Its
    /// `in_channels` must equal `num_features - raw_features`.
    #[serde(default)]
    pub conv: Option<EgatConfig>,
}

impl ModelConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    #[must_use]
    pub fn nodes_per_graph(&self) -> usize {
        self.num_nodes / self.batch_size.max(1)
    }

    /// Node features that go through the embedding.
    #[must_use]
    pub fn embedded_features(&self) -> usize {
        self.num_features.saturating_sub(self.raw_features)
    }

    pub fn validate(&self) -> Result<()> {
        crate::graph::check_batch_divides(self.num_nodes, self.batch_size)?;
        if self.num_features <= self.raw_features {
            return Err(Error::InvalidConfig(format!(
                "num_features ({}) must exceed raw_features ({})",
                self.num_features, self.raw_features
            )));
        }
        if self.hidden == 0 || self.num_classes == 0 {
            return Err(Error::InvalidConfig(
                "hidden and num_classes must be positive".into(),
            ));
        }
        check_dropout(self.dropout)?;
        if let Some(conv) = &self.conv {
            conv.validate()?;
            if conv.in_channels != self.embedded_features() {
                return Err(Error::shape(
                    "conv in_channels",
                    self.embedded_features(),
                    conv.in_channels,
                ));
            }
        }
        Ok(())
    }
}

fn check_widths(in_channels: usize, out_channels: usize, slices: usize, name: &str) -> Result<()> {
    if in_channels == 0 || out_channels == 0 || slices == 0 {
        return Err(Error::InvalidConfig(format!(
            "in_channels, out_channels and {name} must be positive"
        )));
    }
    Ok(())
}

fn check_attention(negative_slope: f64, dropout: f32) -> Result<()> {
    if !negative_slope.is_finite() {
        return Err(Error::InvalidConfig(format!(
            "negative_slope must be finite, got {negative_slope}"
        )));
    }
    check_dropout(dropout)
}

fn check_dropout(dropout: f32) -> Result<()> {
    if !(0.0..1.0).contains(&dropout) {
        return Err(Error::InvalidConfig(format!(
            "dropout must be in [0, 1), got {dropout}"
        )));
    }
    Ok(())
}
