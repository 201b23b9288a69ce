//! Prediction path around the graph embedding
//!
//! - [`AtomEncoder`]: learned embedding table indexed by atomic number, used
//!   in place of hand-made atom features
//! - [`PropertyHead`]: `linear → sigmoid → linear`, producing logits
//! - [`PropertyModel`]: atom encoder + [`MolKgnnNet`] + property head
//!
//! Losses live in [`crate::primitives`] (`bce_with_logits` for the binary
//! task). The optimizer loop is left to the caller.

use crate::config::KgnnConfig;
use crate::net::{GraphOutput, MolKgnnNet, MolecularBatch};
use crate::primitives::{sigmoid, Linear};
use crate::{KgnnError, Result};
use candle_core::{Device, Tensor, Var};

/// Size of the atomic-number embedding table.
pub const NUM_ELEMENTS: usize = 118;

/// Embedding table `(NUM_ELEMENTS, dim)`.
#[derive(Debug)]
pub struct AtomEncoder {
    pub table: Var,
}

impl AtomEncoder {
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        let init = Tensor::randn(0.0f32, 1.0, (NUM_ELEMENTS, dim), device)
            .map_err(|e| KgnnError::Tensor(format!("atom table init failed: {}", e)))?;
        let table = Var::from_tensor(&init)
            .map_err(|e| KgnnError::Tensor(format!("atom table var failed: {}", e)))?;
        Ok(Self { table })
    }

    pub fn dim(&self) -> usize {
        self.table.as_tensor().dims()[1]
    }

    /// Rows of the table for `atomic_numbers: (n)` u32, each below [`NUM_ELEMENTS`].
    pub fn forward(&self, atomic_numbers: &Tensor) -> Result<Tensor> {
        let values = atomic_numbers
            .to_vec1::<u32>()
            .map_err(|e| KgnnError::Tensor(format!("atomic number read failed: {}", e)))?;
        if let Some(&bad) = values.iter().find(|&&z| z as usize >= NUM_ELEMENTS) {
            return Err(KgnnError::dims("atomic number bound", NUM_ELEMENTS, bad as usize));
        }
        self.table
            .as_tensor()
            .index_select(atomic_numbers, 0)
            .map_err(|e| KgnnError::Tensor(format!("atom embedding lookup failed: {}", e)))
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        vec![("atom_encoder.table".to_string(), self.table.clone())]
    }
}

/// `lin2(sigmoid(lin1(embedding)))`, returning logits.
#[derive(Debug)]
pub struct PropertyHead {
    lin1: Linear,
    lin2: Linear,
}

impl PropertyHead {
    pub fn new(embedding_dim: usize, output_dim: usize, device: &Device) -> Result<Self> {
        if output_dim == 0 {
            return Err(KgnnError::Configuration("property head output width must be positive".into()));
        }
        Ok(Self {
            lin1: Linear::new(embedding_dim, embedding_dim, device)?,
            lin2: Linear::new(embedding_dim, output_dim, device)?,
        })
    }

    pub fn output_dim(&self) -> usize {
        self.lin2.out_dim()
    }

    pub fn forward(&self, graph_embedding: &Tensor) -> Result<Tensor> {
        let hidden = sigmoid(&self.lin1.forward(graph_embedding)?)?;
        self.lin2.forward(&hidden)
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        vec![
            ("predictor.lin1.weight".to_string(), self.lin1.weight.clone()),
            ("predictor.lin1.bias".to_string(), self.lin1.bias.clone()),
            ("predictor.lin2.weight".to_string(), self.lin2.weight.clone()),
            ("predictor.lin2.bias".to_string(), self.lin2.bias.clone()),
        ]
    }
}

/// Atom encoder, kernel network and property head in one module.
///
/// The network's `node_feature_dim` is the atom embedding width.
#[derive(Debug)]
pub struct PropertyModel {
    atom_encoder: AtomEncoder,
    net: MolKgnnNet,
    head: PropertyHead,
}

/// Logits plus the network output they were computed from.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub logits: Tensor,
    pub output: GraphOutput,
}

impl PropertyModel {
    pub fn new(config: KgnnConfig, output_dim: usize, device: &Device) -> Result<Self> {
        let atom_encoder = AtomEncoder::new(config.node_feature_dim, device)?;
        let head = PropertyHead::new(config.graph_embedding_dim, output_dim, device)?;
        let net = MolKgnnNet::new(config, device)?;
        Ok(Self {
            atom_encoder,
            net,
            head,
        })
    }

    pub fn net(&self) -> &MolKgnnNet {
        &self.net
    }

    /// Embed atoms by atomic number, run the network, project to logits.
    pub fn forward_t(&self, batch: &MolecularBatch, train: bool) -> Result<Prediction> {
        let atomic_numbers = batch
            .atomic_numbers
            .as_ref()
            .ok_or_else(|| KgnnError::Configuration("batch carries no atomic numbers".into()))?;
        let embedded = batch.with_node_features(self.atom_encoder.forward(atomic_numbers)?)?;
        let output = self.net.forward_t(&embedded, train)?;
        let logits = self.head.forward(&output.graph_embedding)?;
        Ok(Prediction { logits, output })
    }

    pub fn forward(&self, batch: &MolecularBatch) -> Result<Prediction> {
        self.forward_t(batch, false)
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.atom_encoder.named_vars();
        vars.extend(self.net.named_vars());
        vars.extend(self.head.named_vars());
        vars
    }

    /// Parameters for an external optimizer; running statistics excluded.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.atom_encoder.named_vars().into_iter().map(|(_, v)| v).collect();
        vars.extend(self.net.trainable_vars());
        vars.extend(self.head.named_vars().into_iter().map(|(_, v)| v));
        vars
    }
}
