//! Graph embedding head
//!
//! ```text
//! per-atom repr (n, W) ──sum per molecule──▶ (M, W) ──lin1──▶ swish ──dropout──▶ lin2 ──▶ (M, E)
//! ```
//!
//! Summation makes the embedding independent of the order atoms are listed in.

use crate::primitives::{dropout, swish, Linear};
use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};

/// Sum rows of `node_repr` that share a molecule id, `(n, W) -> (num_molecules, W)`.
///
/// Molecules with no atoms get a zero row.
pub fn sum_pool(node_repr: &Tensor, molecule_ids: &Tensor, num_molecules: usize) -> Result<Tensor> {
    let (n, width) = node_repr
        .dims2()
        .map_err(|e| KgnnError::Tensor(format!("pool dims failed: {}", e)))?;
    let ids = molecule_ids
        .dims1()
        .map_err(|e| KgnnError::Tensor(format!("pool id dims failed: {}", e)))?;
    if ids != n {
        return Err(KgnnError::dims("molecule ids", n, ids));
    }
    let pooled = Tensor::zeros((num_molecules, width), DType::F32, node_repr.device())
        .map_err(|e| KgnnError::Tensor(format!("pool init failed: {}", e)))?;
    if n == 0 {
        return Ok(pooled);
    }
    pooled
        .index_add(molecule_ids, node_repr, 0)
        .map_err(|e| KgnnError::Tensor(format!("pool scatter failed: {}", e)))
}

#[derive(Debug)]
pub struct GraphEmbeddingHead {
    lin1: Linear,
    lin2: Linear,
    dropout: f32,
}

impl GraphEmbeddingHead {
    pub fn new(in_dim: usize, embedding_dim: usize, dropout: f32, device: &Device) -> Result<Self> {
        if embedding_dim == 0 {
            return Err(KgnnError::Configuration("graph embedding width must be positive".into()));
        }
        if !(0.0..1.0).contains(&dropout) {
            return Err(KgnnError::Configuration(format!(
                "dropout must be in [0, 1), got {}",
                dropout
            )));
        }
        Ok(Self {
            lin1: Linear::new(in_dim, embedding_dim, device)?,
            lin2: Linear::new(embedding_dim, embedding_dim, device)?,
            dropout,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.lin1.in_dim()
    }

    pub fn embedding_dim(&self) -> usize {
        self.lin2.out_dim()
    }

    /// Graph embeddings `(num_molecules, embedding_dim)`; dropout only when `train`.
    pub fn forward_t(
        &self,
        node_repr: &Tensor,
        molecule_ids: &Tensor,
        num_molecules: usize,
        train: bool,
    ) -> Result<Tensor> {
        let width = node_repr
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("head input dims failed: {}", e)))?
            .1;
        if width != self.in_dim() {
            return Err(KgnnError::dims("head input width", self.in_dim(), width));
        }
        let pooled = sum_pool(node_repr, molecule_ids, num_molecules)?;
        let hidden = swish(&self.lin1.forward(&pooled)?)?;
        let hidden = dropout(&hidden, self.dropout, train)?;
        self.lin2.forward(&hidden)
    }

    /// Evaluation-mode forward.
    pub fn forward(&self, node_repr: &Tensor, molecule_ids: &Tensor, num_molecules: usize) -> Result<Tensor> {
        self.forward_t(node_repr, molecule_ids, num_molecules, false)
    }

    /// Parameters keyed `head.lin{1|2}.{weight|bias}`.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        vec![
            ("head.lin1.weight".to_string(), self.lin1.weight.clone()),
            ("head.lin1.bias".to_string(), self.lin1.bias.clone()),
            ("head.lin2.weight".to_string(), self.lin2.weight.clone()),
            ("head.lin2.bias".to_string(), self.lin2.bias.clone()),
        ]
    }
}
