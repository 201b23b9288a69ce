//! Normalization and dropout
//!
//! - [`layer_norm`]: statistics over each row's features. Used on atom
//!   representations before every kernel layer, so a row's output depends on
//!   that row alone.
//! - [`batch_norm`]: per-column statistics. Training normalizes with the
//!   rows of the current call and folds them into running buffers;
//!   evaluation normalizes with the running buffers only, so a row's output
//!   does not depend on the other rows of the call. Used once per forward
//!   pass on edge attributes.

use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};

const NORM_EPS: f64 = 1e-5;

/// Weight of the current batch in a running-statistics update.
pub const BATCH_NORM_MOMENTUM: f64 = 0.1;

/// Learnable affine parameters of a normalization layer.
#[derive(Debug)]
pub struct LayerNormParams {
    pub gamma: Var,
    pub beta: Var,
}

impl LayerNormParams {
    /// Identity-initialized parameters (`gamma = 1`, `beta = 0`).
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let gamma = Var::ones(dim, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("norm gamma init failed: {}", e)))?;
        let beta = Var::zeros(dim, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("norm beta init failed: {}", e)))?;
        Ok(Self { gamma, beta })
    }

    pub fn dim(&self) -> usize {
        self.gamma.as_tensor().elem_count()
    }
}

/// Affine parameters plus running mean/variance buffers.
///
/// The buffers are `Var`s so they persist with the rest of the network, but
/// they are updated only by [`batch_norm`] in training mode, never by an
/// optimizer.
#[derive(Debug)]
pub struct BatchNormParams {
    pub affine: LayerNormParams,
    pub running_mean: Var,
    pub running_var: Var,
}

impl BatchNormParams {
    /// Identity affine, running mean 0 and running variance 1.
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let affine = LayerNormParams::new(dim, device)?;
        let running_mean = Var::zeros(dim, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("norm running mean init failed: {}", e)))?;
        let running_var = Var::ones(dim, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("norm running var init failed: {}", e)))?;
        Ok(Self {
            affine,
            running_mean,
            running_var,
        })
    }

    pub fn dim(&self) -> usize {
        self.affine.dim()
    }
}

/// Row-wise layer normalization: `(x - mean_row) / std_row * gamma + beta`.
pub fn layer_norm(x: &Tensor, params: &LayerNormParams) -> Result<Tensor> {
    check_width(x, params.dim(), "layer_norm")?;
    let (mean, var) = moments(x, 1, "layer_norm")?;
    standardize(x, &mean, &var, params, "layer_norm")
}

/// Column-wise batch normalization of `x: (rows, dim)`.
///
/// With `train` set, the rows of `x` supply the statistics and the running
/// buffers move toward them by [`BATCH_NORM_MOMENTUM`] (unbiased variance,
/// as the buffers estimate a population). Otherwise the running buffers are
/// used and left untouched. An empty tensor passes through unchanged.
pub fn batch_norm(x: &Tensor, params: &BatchNormParams, train: bool) -> Result<Tensor> {
    let rows = check_width(x, params.dim(), "batch_norm")?;
    if rows == 0 {
        return Ok(x.clone());
    }
    if !train {
        let mean = params.running_mean.as_tensor();
        let var = params.running_var.as_tensor();
        return standardize(x, mean, var, &params.affine, "batch_norm");
    }

    let (mean, var) = moments(x, 0, "batch_norm")?;
    let out = standardize(x, &mean, &var, &params.affine, "batch_norm")?;

    let unbiased = if rows > 1 { rows as f64 / (rows - 1) as f64 } else { 1.0 };
    let update = |buffer: &Var, batch: &Tensor, scale: f64, name: &str| {
        let blended = batch
            .detach()
            .squeeze(0)
            .and_then(|t| t.affine(scale * BATCH_NORM_MOMENTUM, 0.0))
            .and_then(|t| {
                buffer
                    .as_tensor()
                    .affine(1.0 - BATCH_NORM_MOMENTUM, 0.0)
                    .and_then(|old| old.add(&t))
            })
            .map_err(|e| KgnnError::Tensor(format!("batch_norm running {} failed: {}", name, e)))?;
        buffer
            .set(&blended)
            .map_err(|e| KgnnError::Tensor(format!("batch_norm running {} set failed: {}", name, e)))
    };
    update(&params.running_mean, &mean, 1.0, "mean")?;
    update(&params.running_var, &var, unbiased, "var")?;
    Ok(out)
}

fn check_width(x: &Tensor, dim: usize, step: &str) -> Result<usize> {
    let (rows, width) = x
        .dims2()
        .map_err(|e| KgnnError::Tensor(format!("{} dims failed: {}", step, e)))?;
    if width != dim {
        return Err(KgnnError::dims(format!("{} width", step), dim, width));
    }
    Ok(rows)
}

/// Mean and biased variance along `dim`, both keeping the reduced dimension.
fn moments(x: &Tensor, dim: usize, step: &str) -> Result<(Tensor, Tensor)> {
    let mean = x
        .mean_keepdim(dim)
        .map_err(|e| KgnnError::Tensor(format!("{} mean failed: {}", step, e)))?;
    let var = x
        .broadcast_sub(&mean)
        .and_then(|t| t.sqr())
        .and_then(|t| t.mean_keepdim(dim))
        .map_err(|e| KgnnError::Tensor(format!("{} variance failed: {}", step, e)))?;
    Ok((mean, var))
}

fn standardize(x: &Tensor, mean: &Tensor, var: &Tensor, params: &LayerNormParams, step: &str) -> Result<Tensor> {
    let std = var
        .affine(1.0, NORM_EPS)
        .and_then(|t| t.sqrt())
        .map_err(|e| KgnnError::Tensor(format!("{} std failed: {}", step, e)))?;
    x.broadcast_sub(mean)
        .and_then(|t| t.broadcast_div(&std))
        .and_then(|t| t.broadcast_mul(params.gamma.as_tensor()))
        .and_then(|t| t.broadcast_add(params.beta.as_tensor()))
        .map_err(|e| KgnnError::Tensor(format!("{} affine failed: {}", step, e)))
}

/// Inverted dropout, active only when `train` is set.
///
/// Evaluation mode returns the input unchanged, which keeps repeated
/// evaluation passes bit-identical.
pub fn dropout(x: &Tensor, rate: f32, train: bool) -> Result<Tensor> {
    if !train || rate <= 0.0 {
        return Ok(x.clone());
    }
    if rate >= 1.0 {
        return Err(KgnnError::Configuration(format!(
            "dropout rate must be below 1.0, got {}",
            rate
        )));
    }
    candle_nn::ops::dropout(x, rate)
        .map_err(|e| KgnnError::Tensor(format!("dropout failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_layer_norm_rows_are_standardized() {
        let params = LayerNormParams::new(4, &device()).unwrap();
        let x = Tensor::from_vec(
            vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 14.0],
            (2, 4),
            &device(),
        )
        .unwrap();

        let y = layer_norm(&x, &params).unwrap().to_vec2::<f32>().unwrap();
        for row in &y {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_layer_norm_row_independence() {
        let params = LayerNormParams::new(3, &device()).unwrap();
        let a = Tensor::from_vec(vec![1.0f32, 5.0, 2.0, 0.0, 0.0, 9.0], (2, 3), &device()).unwrap();
        let b = Tensor::from_vec(vec![1.0f32, 5.0, 2.0, -4.0, 7.0, 1.0], (2, 3), &device()).unwrap();

        let ya = layer_norm(&a, &params).unwrap().to_vec2::<f32>().unwrap();
        let yb = layer_norm(&b, &params).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(ya[0], yb[0]);
    }

    #[test]
    fn test_batch_norm_train_uses_batch_statistics() {
        let params = BatchNormParams::new(2, &device()).unwrap();
        let x = Tensor::from_vec(vec![1.0f32, 100.0, 3.0, 300.0], (2, 2), &device()).unwrap();

        let y = batch_norm(&x, &params, true).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] + 1.0).abs() < 1e-3);
        assert!((y[1][0] - 1.0).abs() < 1e-3);
        assert!((y[0][1] + 1.0).abs() < 1e-3);

        // mean [2, 200], unbiased var [2, 20000], momentum 0.1
        let mean = params.running_mean.as_tensor().to_vec1::<f32>().unwrap();
        let var = params.running_var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((mean[0] - 0.2).abs() < 1e-5);
        assert!((mean[1] - 20.0).abs() < 1e-3);
        assert!((var[0] - (0.9 + 0.2)).abs() < 1e-5);
        assert!((var[1] - (0.9 + 2000.0)).abs() < 1e-1);
    }

    #[test]
    fn test_batch_norm_eval_uses_running_statistics() {
        let params = BatchNormParams::new(1, &device()).unwrap();
        params
            .running_mean
            .set(&Tensor::from_vec(vec![2.0f32], 1, &device()).unwrap())
            .unwrap();
        params
            .running_var
            .set(&Tensor::from_vec(vec![4.0f32], 1, &device()).unwrap())
            .unwrap();

        // Constant columns keep their value relative to the running mean
        let x = Tensor::from_vec(vec![6.0f32, 6.0], (2, 1), &device()).unwrap();
        let y = batch_norm(&x, &params, false).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - 2.0).abs() < 1e-4);
        assert!((y[1][0] - 2.0).abs() < 1e-4);

        // Each row depends only on itself
        let alone = Tensor::from_vec(vec![6.0f32], (1, 1), &device()).unwrap();
        let y_alone = batch_norm(&alone, &params, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y_alone[0], y[0]);

        assert_eq!(params.running_mean.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0]);
        assert_eq!(params.running_var.as_tensor().to_vec1::<f32>().unwrap(), vec![4.0]);
    }

    #[test]
    fn test_batch_norm_empty_passthrough() {
        let params = BatchNormParams::new(3, &device()).unwrap();
        let x = Tensor::zeros((0, 3), DType::F32, &device()).unwrap();
        assert_eq!(batch_norm(&x, &params, true).unwrap().dims(), &[0, 3]);
        assert_eq!(batch_norm(&x, &params, false).unwrap().dims(), &[0, 3]);
        assert_eq!(params.running_mean.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_norm_width_mismatch() {
        let params = LayerNormParams::new(3, &device()).unwrap();
        let x = Tensor::zeros((2, 4), DType::F32, &device()).unwrap();
        let err = layer_norm(&x, &params).unwrap_err();
        assert!(matches!(err, KgnnError::DimensionMismatch { expected: 3, got: 4, .. }));

        let params = BatchNormParams::new(3, &device()).unwrap();
        assert!(matches!(
            batch_norm(&x, &params, false),
            Err(KgnnError::DimensionMismatch { expected: 3, got: 4, .. })
        ));
    }

    #[test]
    fn test_dropout_eval_is_identity() {
        let x = Tensor::randn(0.0f32, 1.0, (4, 5), &device()).unwrap();
        let y = dropout(&x, 0.5, false).unwrap();
        assert_eq!(x.to_vec2::<f32>().unwrap(), y.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_dropout_train_zeroes_or_scales() {
        let x = Tensor::ones((8, 8), DType::F32, &device()).unwrap();
        let y = dropout(&x, 0.5, true).unwrap().to_vec2::<f32>().unwrap();
        for v in y.iter().flatten() {
            assert!(v.abs() < 1e-6 || (v - 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_dropout_rate_one_rejected() {
        let x = Tensor::ones(3, DType::F32, &device()).unwrap();
        assert!(dropout(&x, 1.0, true).is_err());
        assert!(dropout(&x, 1.0, false).is_ok());
    }
}
