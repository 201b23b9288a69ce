//! Tensor Primitives
//!
//! Building blocks shared by the kernel layers and the embedding head.
//!
//! ## Submodules
//!
//! - `tensor_ops`: Device selection, index tensors, losses
//! - `activations`: Activation functions (sigmoid, swish, relu, tanh)
//! - `norm`: Layer / batch-statistics normalization and dropout
//! - `linear`: Affine parameter block

mod activations;
mod linear;
mod norm;
mod tensor_ops;

// Re-export all primitives at module level
pub use activations::*;
pub use linear::*;
pub use norm::*;
pub use tensor_ops::*;
