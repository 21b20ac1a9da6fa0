//! Optional side channel for inspecting intermediate attention tensors.
//!
//! A collector is handed to a layer's `forward_with` by the caller. Collectors swallow their own
//! failures: recording never changes or aborts a forward pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::warn;

use crate::error::Result;

/// Points in the attention kernel where a snapshot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Attention vector times concatenated endpoint projections, before the sum. `(E, H, 2F)`.
    Scores,
    /// Per-edge logits after leaky-ReLU. `(E, H)`.
    Logits,
    /// Per-target softmax of the logits. Only the softmax-normalized layer records it.
    Normalized,
    /// Coefficients after edge-attribute weighting (and normalization), before dropout.
    Weights,
    /// Edge index the weights belong to.
    EdgeIndex,
}

impl Stage {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Stage::Scores => "scores",
            Stage::Logits => "logits",
            Stage::Normalized => "normalized",
            Stage::Weights => "weights",
            Stage::EdgeIndex => "edge_index",
        }
    }
}

pub trait DiagnosticsCollector {
    /// Records one snapshot of `tensor` for `stage`.
    fn append(&mut self, stage: Stage, tensor: &Tensor);
}

/// Keeps snapshots in memory, detached from the autograd graph.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    entries: HashMap<Stage, Vec<Tensor>>,
}

impl MemoryCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots for `stage`, oldest first.
    #[must_use]
    pub fn get(&self, stage: Stage) -> &[Tensor] {
        self.entries.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }
}

impl DiagnosticsCollector for MemoryCollector {
    fn append(&mut self, stage: Stage, tensor: &Tensor) {
        self.entries.entry(stage).or_default().push(tensor.detach());
    }
}

/// Accumulates snapshots in `<dir>/<stage>.safetensors`, one tensor per call keyed by its
/// zero-padded sequence number.
///
/// An unreadable file is treated as empty and overwritten; a failed write is logged and
/// dropped.
#[derive(Debug, Clone)]
pub struct SafetensorsCollector {
    dir: PathBuf,
}

impl SafetensorsCollector {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path(&self, stage: Stage) -> PathBuf {
        self.dir.join(format!("{}.safetensors", stage.name()))
    }

    /// Reads back every snapshot recorded for `stage`, oldest first.
    pub fn load(&self, stage: Stage) -> Result<Vec<Tensor>> {
        let mut entries: Vec<(String, Tensor)> =
            candle_core::safetensors::load(self.path(stage), &Device::Cpu)?
                .into_iter()
                .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, t)| t).collect())
    }

    fn previous(path: &Path) -> HashMap<String, Tensor> {
        if !path.exists() {
            return HashMap::new();
        }
        match candle_core::safetensors::load(path, &Device::Cpu) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), %err, "diagnostics file unreadable, starting fresh");
                HashMap::new()
            }
        }
    }

    fn try_append(&self, stage: Stage, tensor: &Tensor) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(stage);
        let mut entries = Self::previous(&path);
        let snapshot = tensor.detach().to_device(&Device::Cpu)?.contiguous()?;
        entries.insert(format!("{:08}", entries.len()), snapshot);
        candle_core::safetensors::save(&entries, &path)?;
        Ok(())
    }
}

impl DiagnosticsCollector for SafetensorsCollector {
    fn append(&mut self, stage: Stage, tensor: &Tensor) {
        if let Err(err) = self.try_append(stage, tensor) {
            warn!(stage = stage.name(), %err, "dropping diagnostics snapshot");
        }
    }
}
