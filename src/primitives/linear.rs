//! Affine parameter block
//!
//! `y = x @ W + b` with `W: (in_dim, out_dim)` and `b: (out_dim)`. Weights are
//! drawn from N(0, 1/in_dim), biases start at zero.

use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};

#[derive(Debug)]
pub struct Linear {
    pub weight: Var,
    pub bias: Var,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, device: &Device) -> Result<Self> {
        let weight = Var::from_tensor(
            &Tensor::randn(0.0f32, init_std(in_dim), (in_dim, out_dim), device)
                .map_err(|e| KgnnError::Tensor(format!("linear weight init failed: {}", e)))?,
        )
        .map_err(|e| KgnnError::Tensor(format!("linear weight var failed: {}", e)))?;
        let bias = Var::zeros(out_dim, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("linear bias init failed: {}", e)))?;
        Ok(Self { weight, bias })
    }

    pub fn in_dim(&self) -> usize {
        self.weight.as_tensor().dims()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.as_tensor().dims()[1]
    }

    /// Apply to a `(rows, in_dim)` tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let width = x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("linear input dims failed: {}", e)))?
            .1;
        if width != self.in_dim() {
            return Err(KgnnError::dims("linear input", self.in_dim(), width));
        }
        x.matmul(self.weight.as_tensor())
            .map_err(|e| KgnnError::Tensor(format!("linear matmul failed: {}", e)))?
            .broadcast_add(self.bias.as_tensor())
            .map_err(|e| KgnnError::Tensor(format!("linear add bias failed: {}", e)))
    }
}

/// Standard deviation for a weight with `fan_in` inputs.
pub(crate) fn init_std(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_linear_shapes() {
        let lin = Linear::new(5, 3, &device()).unwrap();
        assert_eq!(lin.in_dim(), 5);
        assert_eq!(lin.out_dim(), 3);

        let x = Tensor::randn(0.0f32, 1.0, (4, 5), &device()).unwrap();
        assert_eq!(lin.forward(&x).unwrap().dims(), &[4, 3]);
    }

    #[test]
    fn test_linear_zero_input_gives_bias() {
        let lin = Linear::new(2, 2, &device()).unwrap();
        lin.bias
            .set(&Tensor::from_vec(vec![0.5f32, -1.5], 2, &device()).unwrap())
            .unwrap();

        let x = Tensor::zeros((1, 2), DType::F32, &device()).unwrap();
        let y = lin.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y[0], vec![0.5, -1.5]);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let lin = Linear::new(4, 2, &device()).unwrap();
        let x = Tensor::zeros((1, 3), DType::F32, &device()).unwrap();
        assert!(matches!(
            lin.forward(&x),
            Err(KgnnError::DimensionMismatch { expected: 4, got: 3, .. })
        ));
    }

    #[test]
    fn test_init_std() {
        assert!((init_std(4) - 0.5).abs() < 1e-6);
        assert!((init_std(0) - 1.0).abs() < 1e-6);
    }
}
