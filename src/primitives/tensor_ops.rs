//! Core Tensor Operations
//!
//! Device selection and the loss functions an external training loop uses
//! on top of the graph embedding.
//!
//! ## Device selection
//!
//! Set `MOLKGNN_NO_GPU=1` to force CPU even when the crate was built with the
//! `metal` or `cuda` feature:
//!
//! ```bash
//! export MOLKGNN_NO_GPU=1
//! ```

use crate::{KgnnError, Result};
use candle_core::{Device, Tensor};
use tracing::info;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via the `MOLKGNN_NO_GPU` environment variable.
pub fn gpu_disabled() -> bool {
    std::env::var("MOLKGNN_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `MOLKGNN_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("Using CPU device (MOLKGNN_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("Using CUDA device");
            return device;
        }
    }

    info!("Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

/// Check if Metal is available (respects MOLKGNN_NO_GPU)
#[cfg(feature = "metal")]
pub fn metal_available() -> bool {
    !gpu_disabled() && Device::new_metal(0).is_ok()
}

/// Check if Metal is available (always false when `metal` feature is not enabled)
#[cfg(not(feature = "metal"))]
pub fn metal_available() -> bool {
    false
}

/// Check if CUDA is available (respects MOLKGNN_NO_GPU)
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    !gpu_disabled() && Device::new_cuda(0).is_ok()
}

/// Check if CUDA is available (always false when `cuda` feature is not enabled)
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

/// Check if any GPU is available and enabled
pub fn gpu_available() -> bool {
    !gpu_disabled() && (metal_available() || cuda_available())
}

// ============================================================================
// Index helpers
// ============================================================================

/// Build a 1D `u32` index tensor for `index_select` / `index_add`.
pub fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_vec(indices.to_vec(), indices.len(), device)
        .map_err(|e| KgnnError::Tensor(format!("index tensor failed: {}", e)))
}

// ============================================================================
// Losses
// ============================================================================

/// Binary cross-entropy on logits, numerically stable form
///
/// BCE(x, y) = max(x, 0) - x·y + log(1 + e^(-|x|)), averaged over elements.
pub fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let positive = logits
        .relu()
        .map_err(|e| KgnnError::Tensor(format!("bce relu failed: {}", e)))?;
    let xy = logits
        .mul(target)
        .map_err(|e| KgnnError::Tensor(format!("bce x*y failed: {}", e)))?;
    let softplus = logits
        .abs()
        .and_then(|t| t.neg())
        .and_then(|t| t.exp())
        .and_then(|t| t + 1.0)
        .and_then(|t| t.log())
        .map_err(|e| KgnnError::Tensor(format!("bce log1p failed: {}", e)))?;

    let loss = (&positive - &xy)
        .and_then(|t| t + softplus)
        .map_err(|e| KgnnError::Tensor(format!("bce combine failed: {}", e)))?;
    loss.mean_all()
        .map_err(|e| KgnnError::Tensor(format!("bce mean failed: {}", e)))
}

/// Binary cross-entropy loss on probabilities
///
/// BCE = -[y * log(p) + (1-y) * log(1-p)]
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let eps = 1e-7f32;
    let pred_clamped = pred
        .clamp(eps, 1.0 - eps)
        .map_err(|e| KgnnError::Tensor(format!("Clamp failed: {}", e)))?;
    let log_p = pred_clamped
        .log()
        .map_err(|e| KgnnError::Tensor(format!("Log failed: {}", e)))?;

    // ones_like keeps the dtype (a 1.0 literal would promote to F64)
    let ones = Tensor::ones_like(&pred_clamped)
        .map_err(|e| KgnnError::Tensor(format!("ones_like failed: {}", e)))?;
    let log_1_p = (&ones - &pred_clamped)
        .and_then(|t| t.log())
        .map_err(|e| KgnnError::Tensor(format!("Log 1-p failed: {}", e)))?;

    let term1 = target
        .mul(&log_p)
        .map_err(|e| KgnnError::Tensor(format!("BCE term1 failed: {}", e)))?;
    let ones_target = Tensor::ones_like(target)
        .map_err(|e| KgnnError::Tensor(format!("ones_like target failed: {}", e)))?;
    let term2 = (&ones_target - target)
        .and_then(|t| t.mul(&log_1_p))
        .map_err(|e| KgnnError::Tensor(format!("BCE term2 failed: {}", e)))?;

    (term1 + term2)
        .and_then(|t| t.neg())
        .and_then(|t| t.mean_all())
        .map_err(|e| KgnnError::Tensor(format!("BCE mean failed: {}", e)))
}

/// Mean squared error loss
pub fn mse_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (pred - target).map_err(|e| KgnnError::Tensor(format!("MSE diff failed: {}", e)))?;
    diff.sqr()
        .and_then(|t| t.mean_all())
        .map_err(|e| KgnnError::Tensor(format!("MSE failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_device() {
        let device = best_device();
        assert!(matches!(
            device,
            Device::Cpu | Device::Metal(_) | Device::Cuda(_)
        ));
    }

    #[test]
    fn test_cpu_device() {
        assert!(matches!(cpu_device(), Device::Cpu));
    }

    #[test]
    fn test_gpu_flags_do_not_panic() {
        let _disabled = gpu_disabled();
        let _available = gpu_available();
    }

    #[test]
    fn test_index_tensor() {
        let idx = index_tensor(&[2, 0, 1], &Device::Cpu).unwrap();
        assert_eq!(idx.dims(), &[3]);
        assert_eq!(idx.to_vec1::<u32>().unwrap(), vec![2, 0, 1]);

        let empty = index_tensor(&[], &Device::Cpu).unwrap();
        assert_eq!(empty.dims(), &[0]);
    }

    #[test]
    fn test_mse_loss() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], 3, &device).unwrap();
        let target = Tensor::from_vec(vec![1.0f32, 2.0, 5.0], 3, &device).unwrap();

        let loss = mse_loss(&pred, &target).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 4.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_bce_loss() {
        let device = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.9f32], 1, &device).unwrap();
        let target = Tensor::from_vec(vec![1.0f32], 1, &device).unwrap();

        let loss = binary_cross_entropy(&pred, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // -ln(0.9)
        assert!((loss - 0.10536).abs() < 1e-4);
    }

    #[test]
    fn test_bce_with_logits_matches_probability_form() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![2.0f32, -1.0, 0.5], 3, &device).unwrap();
        let target = Tensor::from_vec(vec![1.0f32, 0.0, 1.0], 3, &device).unwrap();

        let from_logits = bce_with_logits(&logits, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let probs = crate::primitives::sigmoid(&logits).unwrap();
        let from_probs = binary_cross_entropy(&probs, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        assert!((from_logits - from_probs).abs() < 1e-4);
    }

    #[test]
    fn test_bce_with_logits_large_inputs_finite() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![80.0f32, -80.0], 2, &device).unwrap();
        let target = Tensor::from_vec(vec![0.0f32, 1.0], 2, &device).unwrap();

        let loss = bce_with_logits(&logits, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!((loss - 80.0).abs() < 1e-3);
    }
}
