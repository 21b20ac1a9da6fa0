//! egat: edge-aware graph attention.
//!
//! Two message-passing layers over `candle` tensors that weight each edge's message by a learned
//! attention score *and* the edge's own attribute:
//!
//! - [`EGATConv`]: multi-head attention gated by a scalar edge weight, no softmax, self-loops
//!   added by default.
//! - [`MEGATConv`]: one attention slice per attribute dimension, softmax over each node's
//!   incoming edges, then L1-normalized across dimensions.
//!
//! Around them: graph/batch containers with self-loop utilities, scatter primitives, a
//! graph-level classifier head, and optional diagnostics capture. Burn mirrors live behind the
//! `backend-burn` feature.

pub mod config;
pub mod diagnostics;
pub mod egat;
pub mod error;
pub mod graph;
pub mod head;
pub mod init;
pub mod megat;
pub mod models;
pub mod nn;
pub mod scatter;

#[cfg(feature = "backend-burn")]
pub mod burn_egat;

pub use config::{EgatConfig, MegatConfig, ModelConfig};
pub use diagnostics::{DiagnosticsCollector, MemoryCollector, SafetensorsCollector, Stage};
pub use egat::EGATConv;
pub use error::{Error, Result};
pub use graph::{add_self_loops, remove_self_loops, Batch, Graph};
pub use head::ClassifierHead;
pub use megat::MEGATConv;
pub use models::{Baseline, EgatClassifier};
pub use nn::{ConvOutput, EdgeConv};
