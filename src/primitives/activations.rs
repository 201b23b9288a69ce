//! Activation Functions
//!
//! Nonlinearities used between kernel layers and inside the embedding head.

use crate::{KgnnError, Result};
use candle_core::Tensor;

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps any real number to (0, 1). Used by the property head and by
/// [`swish`].
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor
        .neg()
        .map_err(|e| KgnnError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg
        .exp()
        .map_err(|e| KgnnError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| KgnnError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus
        .recip()
        .map_err(|e| KgnnError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Swish activation: x · σ(x)
///
/// The layer and head nonlinearity. Smooth, so kernel responses stay
/// differentiable everywhere.
pub fn swish(tensor: &Tensor) -> Result<Tensor> {
    let gate = sigmoid(tensor)?;
    tensor
        .mul(&gate)
        .map_err(|e| KgnnError::Tensor(format!("swish mul failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .relu()
        .map_err(|e| KgnnError::Tensor(format!("ReLU failed: {}", e)))
}

/// Tanh activation, maps to (-1, 1).
///
/// Squashes per-neighbor partial responses before the symmetric sum.
pub fn tanh(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .tanh()
        .map_err(|e| KgnnError::Tensor(format!("tanh failed: {}", e)))
}
