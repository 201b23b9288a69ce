//! Graph encoder
//!
//! A stack of [`KernelConvLayer`]s. Positions, edge attributes and buckets are
//! shared by every layer; only the per-atom representation flows from one
//! layer to the next. The encoder holds no per-call state, so repeated calls
//! with the same inputs return identical tensors.

use crate::bucket::DegreeBuckets;
use crate::config::KgnnConfig;
use crate::conv::KernelConvLayer;
use crate::{KgnnError, Result};
use candle_core::{Device, Tensor, Var};
use tracing::debug;

/// Every layer's output of one forward pass.
#[derive(Debug, Clone)]
pub struct EncoderTrace {
    pub layers: Vec<Tensor>,
}

impl EncoderTrace {
    /// Output of the last layer.
    pub fn final_representation(&self) -> Result<&Tensor> {
        self.layers
            .last()
            .ok_or_else(|| KgnnError::Configuration("encoder trace holds no layers".into()))
    }
}

#[derive(Debug)]
pub struct GraphEncoder {
    layers: Vec<KernelConvLayer>,
}

impl GraphEncoder {
    pub fn new(config: &KgnnConfig, device: &Device) -> Result<Self> {
        if config.num_layers < 1 {
            return Err(KgnnError::Configuration(format!(
                "encoder needs at least one layer, got {}",
                config.num_layers
            )));
        }
        let layers = (0..config.num_layers)
            .map(|i| KernelConvLayer::new(config, config.layer_input_dim(i), device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[KernelConvLayer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn out_dim(&self) -> usize {
        self.layers.last().map(|l| l.out_dim()).unwrap_or(0)
    }

    /// Final per-atom representation `(n, out_dim)`.
    pub fn forward(&self, x: &Tensor, pos: &Tensor, edge_attr: &Tensor, buckets: &DegreeBuckets) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h, pos, edge_attr, buckets)?;
        }
        Ok(h)
    }

    /// Like [`forward`](Self::forward), keeping every intermediate layer output.
    pub fn forward_trace(
        &self,
        x: &Tensor,
        pos: &Tensor,
        edge_attr: &Tensor,
        buckets: &DegreeBuckets,
    ) -> Result<EncoderTrace> {
        let mut outputs = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, pos, edge_attr, buckets)?;
            debug!(layer = i, dims = ?h.dims(), "encoder layer done");
            outputs.push(h.clone());
        }
        Ok(EncoderTrace { layers: outputs })
    }

    /// Parameters keyed `layers.{i}.*`.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.named_vars(&format!("layers.{}", i)))
            .collect()
    }

    /// Parameters of layer `i` alone, keyed as in [`named_vars`](Self::named_vars).
    pub fn layer_named_vars(&self, i: usize) -> Result<Vec<(String, Var)>> {
        let layer = self
            .layers
            .get(i)
            .ok_or_else(|| KgnnError::dims("encoder layer index", self.layers.len(), i))?;
        Ok(layer.named_vars(&format!("layers.{}", i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Hop;
    use candle_core::DType;

    fn device() -> Device {
        Device::Cpu
    }

    fn config(layers: usize) -> KgnnConfig {
        KgnnConfig::default()
            .with_layers(layers)
            .with_feature_dims(3, 1)
            .with_kernel_counts(Hop::One, [2, 2, 0, 0])
            .with_kernel_counts(Hop::Multi, [1, 1, 0, 0])
            .with_geometry(4, 4.0)
    }

    fn chain() -> (Tensor, Tensor, Tensor, DegreeBuckets) {
        let x = Tensor::randn(0.0f32, 1.0, (3, 3), &device()).unwrap();
        let pos = Tensor::from_vec(
            vec![0.0f32, 0.0, 0.0, 1.4, 0.0, 0.0, 2.1, 1.2, 0.0],
            (3, 3),
            &device(),
        )
        .unwrap();
        let edge_attr = Tensor::ones((4, 1), DType::F32, &device()).unwrap();
        let adjacency = vec![vec![(1, 0)], vec![(0, 1), (2, 2)], vec![(1, 3)]];
        let mut buckets = DegreeBuckets::from_adjacency(Hop::One, &adjacency, &device()).unwrap();
        buckets.mirror_bonded_into_nhop();
        (x, pos, edge_attr, buckets)
    }

    #[test]
    fn test_zero_layers_rejected() {
        let err = GraphEncoder::new(&config(0), &device()).unwrap_err();
        assert!(matches!(err, KgnnError::Configuration(_)));
    }

    #[test]
    fn test_layer_widths() {
        let encoder = GraphEncoder::new(&config(3), &device()).unwrap();
        assert_eq!(encoder.num_layers(), 3);
        assert_eq!(encoder.layers()[0].in_dim(), 3);
        assert_eq!(encoder.layers()[1].in_dim(), 6);
        assert_eq!(encoder.out_dim(), 6);
    }

    #[test]
    fn test_forward_and_trace_agree() {
        let encoder = GraphEncoder::new(&config(2), &device()).unwrap();
        let (x, pos, edge_attr, buckets) = chain();

        let out = encoder.forward(&x, &pos, &edge_attr, &buckets).unwrap();
        assert_eq!(out.dims(), &[3, 6]);

        let trace = encoder.forward_trace(&x, &pos, &edge_attr, &buckets).unwrap();
        assert_eq!(trace.layers.len(), 2);
        assert_eq!(
            trace.final_representation().unwrap().to_vec2::<f32>().unwrap(),
            out.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_forward_is_reproducible() {
        let encoder = GraphEncoder::new(&config(2), &device()).unwrap();
        let (x, pos, edge_attr, buckets) = chain();
        let a = encoder.forward(&x, &pos, &edge_attr, &buckets).unwrap().to_vec2::<f32>().unwrap();
        let b = encoder.forward(&x, &pos, &edge_attr, &buckets).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_named_vars() {
        let encoder = GraphEncoder::new(&config(2), &device()).unwrap();
        let names: Vec<String> = encoder.named_vars().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"layers.1.nhop.deg2.neighbor_weight".to_string()));
        assert!(!names.iter().any(|n| n.contains("deg3")));

        let layer0 = encoder.layer_named_vars(0).unwrap();
        assert!(layer0.iter().all(|(n, _)| n.starts_with("layers.0.")));
        assert!(encoder.layer_named_vars(2).is_err());
    }
}
