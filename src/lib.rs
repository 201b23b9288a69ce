//! # molkgnn
//!
//! Kernel-based geometric graph convolution for molecular property prediction.
//!
//! ## Overview
//!
//! A molecule is a 3D graph: atoms carry feature vectors and positions, bonds
//! carry attribute vectors. This crate learns a fixed-size graph embedding from
//! that graph by convolving every atom with banks of learnable *geometric
//! kernels*. Kernels are stratified by how many neighbors an atom has (its
//! degree bucket, 1..=4) and by hop distance (bonded neighbors vs. a wider
//! multi-hop neighborhood).
//!
//! Core capabilities:
//!
//! - **Geometry**: explicit rotation/translation-invariant features (distances,
//!   neighbor-pair angles) expanded in Gaussian bases
//! - **Kernels**: per-(hop, degree) banks of permutation-invariant kernels
//! - **Degree-bucket convolution**: gather/evaluate/scatter over flat tensors,
//!   restoring the original atom order
//! - **Encoder + embedding head**: stacked layers, sum pooling per molecule,
//!   two affine projections with dropout between them
//! - **Persistence**: named safetensors bundles with JSON metadata sidecars
//!
//! ## Data flow
//!
//! ```text
//! atom features ─┐
//! positions ─────┼─▶ GraphEncoder ──▶ per-atom repr ──▶ GraphEmbeddingHead ──▶ graph embedding
//! edge attrs ────┤   (KernelConvLayer × num_layers)        (sum pool, lin, swish,
//! degree buckets ┘                                           dropout, lin)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use molkgnn::prelude::*;
//!
//! let config = KgnnConfig::default()
//!     .with_layers(2)
//!     .with_feature_dims(5, 1);
//! let net = MolKgnnNet::new(config, &cpu_device())?;
//!
//! let batch = MolecularBatch::from_graphs(&[graph], &cpu_device())?;
//! let output = net.forward(&batch)?;
//! println!("embedding: {:?}", output.graph_embedding.dims());
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod bucket;
pub mod config;
pub mod conv;
pub mod encoder;
pub mod geometry;
pub mod head;
pub mod kernel;
pub mod net;
pub mod predictor;
pub mod primitives;
pub mod storage;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for molecular kernel-GNN operations
#[derive(Debug, thiserror::Error)]
pub enum KgnnError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error("Degree mismatch: {0}")]
    DegreeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl KgnnError {
    pub(crate) fn dims(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            got,
        }
    }
}

/// Result type alias for molkgnn operations
pub type Result<T> = std::result::Result<T, KgnnError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{KgnnError, Result};

    pub use crate::bucket::{Degree, DegreeBucket, DegreeBuckets, Hop, MAX_DEGREE};
    pub use crate::config::KgnnConfig;
    pub use crate::conv::{DegreeBucketConv, KernelConvLayer};
    pub use crate::encoder::{EncoderTrace, GraphEncoder};
    pub use crate::geometry::{GeometricBasis, InvariantFeatures};
    pub use crate::head::GraphEmbeddingHead;
    pub use crate::kernel::{FrameBatch, GeometricKernel, KernelSet, NeighborFrame};
    pub use crate::net::{Bond, GraphOutput, MolKgnnNet, MolecularBatch, MolecularGraph};
    pub use crate::predictor::{AtomEncoder, Prediction, PropertyHead, PropertyModel};
    pub use crate::storage::{
        inspect_checkpoint, load_graph_embedding, save_graph_embedding, CheckpointMetadata, TensorInfo,
    };

    pub use crate::primitives::{
        // Device selection
        best_device, cpu_device, cuda_available, gpu_available, gpu_disabled, metal_available,
        // Activations
        relu, sigmoid, swish, tanh,
        // Losses
        bce_with_logits, binary_cross_entropy, mse_loss,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = best_device();
        assert!(
            matches!(device, Device::Cpu)
                || matches!(device, Device::Metal(_))
                || matches!(device, Device::Cuda(_))
        );
    }

    #[test]
    fn test_error_display() {
        let err = KgnnError::dims("atom features", 5, 7);
        assert_eq!(
            err.to_string(),
            "Dimension mismatch in atom features: expected 5, got 7"
        );

        let err = KgnnError::DegreeMismatch("degree 5 exceeds maximum 4".into());
        assert!(err.to_string().contains("degree 5"));
    }
}
