//! Model configuration
//!
//! Every width in the network derives from [`KgnnConfig`]: the per-(hop, degree)
//! kernel counts fix the per-atom representation width, the feature dims fix
//! the first layer's inputs, and `graph_embedding_dim` fixes the head.
//!
//! ```rust,ignore
//! use molkgnn::prelude::*;
//!
//! let config = KgnnConfig::default()
//!     .with_layers(1)
//!     .with_kernel_counts(Hop::One, [4, 4, 0, 0])
//!     .with_kernel_counts(Hop::Multi, [0, 0, 0, 0]);
//! assert_eq!(config.output_width(), 8);
//! ```

use crate::bucket::{Degree, Hop, MAX_DEGREE};
use crate::{KgnnError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hyperparameters of a [`crate::net::MolKgnnNet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KgnnConfig {
    /// Number of stacked kernel convolution layers (>= 1)
    pub num_layers: usize,

    /// Kernel count per degree for the bonded neighborhood; index K-1 is degree K
    pub num_kernels_1hop: [usize; MAX_DEGREE],

    /// Kernel count per degree for the multi-hop neighborhood
    pub num_kernels_nhop: [usize; MAX_DEGREE],

    /// Width of the input atom feature vectors
    pub node_feature_dim: usize,

    /// Width of the edge attribute vectors
    pub edge_feature_dim: usize,

    /// Width of the pooled graph embedding
    pub graph_embedding_dim: usize,

    /// Number of Gaussians in the radial and angular bases
    pub geometric_dim: usize,

    /// Upper end of the radial basis range, in Ångström
    pub cutoff: f32,

    /// Dropout rate inside the embedding head (training only)
    pub dropout: f32,

    /// Layer-normalize atom features before each kernel layer
    pub node_norm: bool,

    /// Normalize edge attributes once per forward pass
    pub edge_norm: bool,

    /// Add the layer input to its output when widths agree
    pub residual: bool,
}

impl Default for KgnnConfig {
    fn default() -> Self {
        Self {
            num_layers: 4,
            num_kernels_1hop: [10, 20, 30, 50],
            num_kernels_nhop: [10, 20, 30, 50],
            node_feature_dim: 28,
            edge_feature_dim: 7,
            graph_embedding_dim: 32,
            geometric_dim: 8,
            cutoff: 5.0,
            dropout: 0.0,
            node_norm: true,
            edge_norm: true,
            residual: false,
        }
    }
}

impl KgnnConfig {
    pub fn with_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    /// Set the kernel count of one (hop, degree) bank.
    pub fn with_kernels(mut self, hop: Hop, degree: Degree, count: usize) -> Self {
        self.counts_mut(hop)[degree.index()] = count;
        self
    }

    /// Set all four kernel counts of one hop.
    pub fn with_kernel_counts(mut self, hop: Hop, counts: [usize; MAX_DEGREE]) -> Self {
        *self.counts_mut(hop) = counts;
        self
    }

    pub fn with_feature_dims(mut self, node_feature_dim: usize, edge_feature_dim: usize) -> Self {
        self.node_feature_dim = node_feature_dim;
        self.edge_feature_dim = edge_feature_dim;
        self
    }

    pub fn with_embedding_dim(mut self, graph_embedding_dim: usize) -> Self {
        self.graph_embedding_dim = graph_embedding_dim;
        self
    }

    pub fn with_geometry(mut self, geometric_dim: usize, cutoff: f32) -> Self {
        self.geometric_dim = geometric_dim;
        self.cutoff = cutoff;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_node_norm(mut self, enabled: bool) -> Self {
        self.node_norm = enabled;
        self
    }

    pub fn with_edge_norm(mut self, enabled: bool) -> Self {
        self.edge_norm = enabled;
        self
    }

    pub fn with_residual(mut self, enabled: bool) -> Self {
        self.residual = enabled;
        self
    }

    fn counts_mut(&mut self, hop: Hop) -> &mut [usize; MAX_DEGREE] {
        match hop {
            Hop::One => &mut self.num_kernels_1hop,
            Hop::Multi => &mut self.num_kernels_nhop,
        }
    }

    /// Kernel counts of one hop, indexed by degree - 1.
    pub fn kernel_counts(&self, hop: Hop) -> &[usize; MAX_DEGREE] {
        match hop {
            Hop::One => &self.num_kernels_1hop,
            Hop::Multi => &self.num_kernels_nhop,
        }
    }

    pub fn kernel_count(&self, hop: Hop, degree: Degree) -> usize {
        self.kernel_counts(hop)[degree.index()]
    }

    /// Total response width of one hop (sum over degrees).
    pub fn hop_width(&self, hop: Hop) -> usize {
        self.kernel_counts(hop).iter().sum()
    }

    /// Width of every layer's per-atom output.
    pub fn output_width(&self) -> usize {
        self.hop_width(Hop::One) + self.hop_width(Hop::Multi)
    }

    /// Input width of encoder layer `layer`.
    pub fn layer_input_dim(&self, layer: usize) -> usize {
        if layer == 0 {
            self.node_feature_dim
        } else {
            self.output_width()
        }
    }

    /// Check every constraint a network build relies on.
    pub fn validate(&self) -> Result<()> {
        if self.num_layers < 1 {
            return Err(KgnnError::Configuration(format!(
                "num_layers must be at least 1, got {}",
                self.num_layers
            )));
        }
        if self.output_width() == 0 {
            return Err(KgnnError::Configuration(
                "every kernel bank is empty; at least one kernel count must be positive".into(),
            ));
        }
        for (name, value) in [
            ("node_feature_dim", self.node_feature_dim),
            ("edge_feature_dim", self.edge_feature_dim),
            ("graph_embedding_dim", self.graph_embedding_dim),
            ("geometric_dim", self.geometric_dim),
        ] {
            if value == 0 {
                return Err(KgnnError::Configuration(format!("{} must be positive", name)));
            }
        }
        if !(self.cutoff.is_finite() && self.cutoff > 0.0) {
            return Err(KgnnError::Configuration(format!(
                "cutoff must be positive, got {}",
                self.cutoff
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(KgnnError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KgnnError::Serialization(format!("config parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| KgnnError::Serialization(format!("config serialize failed: {}", e)))
    }

    /// Content hash of the configuration, `sha256:{hex}`.
    ///
    /// Two configs with equal fingerprints build parameter bundles with the
    /// same names and shapes.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)
            .map_err(|e| KgnnError::Serialization(format!("config serialize failed: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}
