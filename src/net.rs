//! Molecular batches and the full network
//!
//! [`MolecularGraph`] is one molecule as host data: per-atom features and
//! positions plus undirected bonds with attribute vectors.
//! [`MolecularBatch::from_graphs`] flattens any number of them into
//! whole-batch tensors:
//!
//! - atoms of molecule `g` follow those of molecule `g - 1`; `molecule_ids`
//!   records the owner of every row
//! - every bond becomes two directed edge rows (a→b, b→a) sharing its
//!   attributes, so the edge seen from a focal atom is always its own row
//! - bonded neighborhoods are grouped into 1-hop degree buckets and mirrored
//!   into the N-hop slots, unless explicit N-hop buckets are supplied
//!
//! Callers that featurize elsewhere can assemble a batch directly with
//! [`MolecularBatch::from_tensors`].
//!
//! [`MolKgnnNet`] runs edge normalization, the [`GraphEncoder`] and the
//! [`GraphEmbeddingHead`] over a batch. Edge normalization keeps running
//! statistics: training passes update them, evaluation passes only read
//! them, so a molecule's evaluation embedding does not depend on the other
//! molecules in its batch.

use crate::bucket::{DegreeBuckets, Hop};
use crate::config::KgnnConfig;
use crate::encoder::{EncoderTrace, GraphEncoder};
use crate::head::GraphEmbeddingHead;
use crate::primitives::{batch_norm, index_tensor, BatchNormParams};
use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashSet;
use tracing::{debug, info};

// ============================================================================
// Molecular graph
// ============================================================================

/// Undirected bond between atoms `a` and `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bond {
    pub a: usize,
    pub b: usize,
    pub attributes: Vec<f32>,
}

/// One molecule as host data.
#[derive(Debug, Clone, Default)]
pub struct MolecularGraph {
    pub atom_features: Vec<Vec<f32>>,
    pub positions: Vec<[f32; 3]>,
    pub bonds: Vec<Bond>,
    pub atomic_numbers: Option<Vec<u32>>,
    pub smiles: Option<String>,
    edge_feature_dim: Option<usize>,
}

impl MolecularGraph {
    pub fn new(atom_features: Vec<Vec<f32>>, positions: Vec<[f32; 3]>) -> Result<Self> {
        if atom_features.len() != positions.len() {
            return Err(KgnnError::dims("atom positions", atom_features.len(), positions.len()));
        }
        if let Some(first) = atom_features.first() {
            if let Some(row) = atom_features.iter().find(|r| r.len() != first.len()) {
                return Err(KgnnError::dims("atom feature width", first.len(), row.len()));
            }
        }
        Ok(Self {
            atom_features,
            positions,
            ..Default::default()
        })
    }

    /// Declare the edge attribute width up front (needed for bond-free molecules).
    pub fn with_edge_feature_dim(mut self, dim: usize) -> Self {
        self.edge_feature_dim = Some(dim);
        self
    }

    pub fn with_smiles(mut self, smiles: impl Into<String>) -> Self {
        self.smiles = Some(smiles.into());
        self
    }

    pub fn with_atomic_numbers(mut self, atomic_numbers: Vec<u32>) -> Result<Self> {
        if atomic_numbers.len() != self.num_atoms() {
            return Err(KgnnError::dims("atomic numbers", self.num_atoms(), atomic_numbers.len()));
        }
        self.atomic_numbers = Some(atomic_numbers);
        Ok(self)
    }

    pub fn with_bond(mut self, a: usize, b: usize, attributes: Vec<f32>) -> Result<Self> {
        self.add_bond(a, b, attributes)?;
        Ok(self)
    }

    pub fn add_bond(&mut self, a: usize, b: usize, attributes: Vec<f32>) -> Result<()> {
        let n = self.num_atoms();
        for atom in [a, b] {
            if atom >= n {
                return Err(KgnnError::dims("bond atom index bound", n, atom));
            }
        }
        if a == b {
            return Err(KgnnError::DegreeMismatch(format!("atom {} bonded to itself", a)));
        }
        if self
            .bonds
            .iter()
            .any(|bond| (bond.a, bond.b) == (a, b) || (bond.a, bond.b) == (b, a))
        {
            return Err(KgnnError::DegreeMismatch(format!("bond {}-{} listed twice", a, b)));
        }
        match self.edge_feature_dim {
            Some(dim) if dim != attributes.len() => {
                return Err(KgnnError::dims("bond attribute width", dim, attributes.len()));
            }
            _ => self.edge_feature_dim = Some(attributes.len()),
        }
        self.bonds.push(Bond { a, b, attributes });
        Ok(())
    }

    pub fn num_atoms(&self) -> usize {
        self.atom_features.len()
    }

    pub fn node_feature_dim(&self) -> Option<usize> {
        self.atom_features.first().map(|r| r.len())
    }

    pub fn edge_feature_dim(&self) -> Option<usize> {
        self.edge_feature_dim
    }

    /// Bond count of atom `atom`.
    pub fn degree(&self, atom: usize) -> usize {
        self.bonds.iter().filter(|b| b.a == atom || b.b == atom).count()
    }
}

// ============================================================================
// Batch
// ============================================================================

/// Whole-batch tensors plus degree buckets.
#[derive(Debug, Clone)]
pub struct MolecularBatch {
    /// `(n, node_feature_dim)`
    pub x: Tensor,
    /// `(n, 3)`
    pub pos: Tensor,
    /// `(E, edge_feature_dim)`
    pub edge_attr: Tensor,
    /// `(n)` u32 owner molecule of each atom
    pub molecule_ids: Tensor,
    pub num_molecules: usize,
    pub buckets: DegreeBuckets,
    /// `(n)` u32, present when every molecule carried atomic numbers
    pub atomic_numbers: Option<Tensor>,
    /// One entry per molecule, empty when unknown
    pub smiles: Vec<String>,
}

impl MolecularBatch {
    pub fn from_graphs(graphs: &[MolecularGraph], device: &Device) -> Result<Self> {
        if graphs.is_empty() {
            return Err(KgnnError::Configuration("batch holds no molecules".into()));
        }
        let node_dim = graphs
            .iter()
            .find_map(|g| g.node_feature_dim())
            .ok_or_else(|| KgnnError::Configuration("batch holds no atoms".into()))?;
        let edge_dim = graphs.iter().find_map(|g| g.edge_feature_dim()).unwrap_or(0);

        let mut x = Vec::new();
        let mut pos = Vec::new();
        let mut edge_attr = Vec::new();
        let mut molecule_ids = Vec::new();
        let mut adjacency: Vec<Vec<(u32, u32)>> = Vec::new();
        let mut atomic_numbers = Some(Vec::new());
        let mut num_edges = 0u32;

        for (g, graph) in graphs.iter().enumerate() {
            if let Some(dim) = graph.node_feature_dim() {
                if dim != node_dim {
                    return Err(KgnnError::dims(format!("molecule {} atom feature width", g), node_dim, dim));
                }
            }
            if let Some(dim) = graph.edge_feature_dim() {
                if dim != edge_dim {
                    return Err(KgnnError::dims(format!("molecule {} bond attribute width", g), edge_dim, dim));
                }
            }

            if graph.positions.len() != graph.num_atoms() {
                return Err(KgnnError::dims(
                    format!("molecule {} positions", g),
                    graph.num_atoms(),
                    graph.positions.len(),
                ));
            }
            if let Some(bond) = graph.bonds.iter().find(|b| b.a.max(b.b) >= graph.num_atoms()) {
                return Err(KgnnError::dims(
                    format!("molecule {} bond atom index bound", g),
                    graph.num_atoms(),
                    bond.a.max(bond.b),
                ));
            }
            let mut seen = HashSet::with_capacity(graph.bonds.len());
            for bond in &graph.bonds {
                if bond.a == bond.b {
                    return Err(KgnnError::DegreeMismatch(format!(
                        "molecule {} atom {} bonded to itself",
                        g, bond.a
                    )));
                }
                if !seen.insert((bond.a.min(bond.b), bond.a.max(bond.b))) {
                    return Err(KgnnError::DegreeMismatch(format!(
                        "molecule {} bond {}-{} listed twice",
                        g, bond.a, bond.b
                    )));
                }
            }

            let offset = adjacency.len() as u32;
            for (features, p) in graph.atom_features.iter().zip(&graph.positions) {
                if features.len() != node_dim {
                    return Err(KgnnError::dims(format!("molecule {} atom feature width", g), node_dim, features.len()));
                }
                x.extend_from_slice(features);
                pos.extend_from_slice(p);
                molecule_ids.push(g as u32);
                adjacency.push(Vec::new());
            }
            for bond in &graph.bonds {
                if bond.attributes.len() != edge_dim {
                    return Err(KgnnError::dims(
                        format!("molecule {} bond attribute width", g),
                        edge_dim,
                        bond.attributes.len(),
                    ));
                }
                let (a, b) = (offset + bond.a as u32, offset + bond.b as u32);
                adjacency[a as usize].push((b, num_edges));
                adjacency[b as usize].push((a, num_edges + 1));
                edge_attr.extend_from_slice(&bond.attributes);
                edge_attr.extend_from_slice(&bond.attributes);
                num_edges += 2;
            }
            atomic_numbers = match (atomic_numbers, &graph.atomic_numbers) {
                (Some(mut acc), Some(nums)) => {
                    acc.extend_from_slice(nums);
                    Some(acc)
                }
                _ => None,
            };
        }

        let n = adjacency.len();
        let n_edges = num_edges as usize;
        let mut buckets = DegreeBuckets::from_adjacency(Hop::One, &adjacency, device)?;
        buckets.mirror_bonded_into_nhop();

        let batch = Self {
            x: Tensor::from_vec(x, (n, node_dim), device)
                .map_err(|e| KgnnError::Tensor(format!("batch x failed: {}", e)))?,
            pos: Tensor::from_vec(pos, (n, 3), device)
                .map_err(|e| KgnnError::Tensor(format!("batch pos failed: {}", e)))?,
            edge_attr: Tensor::from_vec(edge_attr, (n_edges, edge_dim), device)
                .map_err(|e| KgnnError::Tensor(format!("batch edge attr failed: {}", e)))?,
            molecule_ids: index_tensor(&molecule_ids, device)?,
            num_molecules: graphs.len(),
            buckets,
            atomic_numbers: atomic_numbers.map(|nums| index_tensor(&nums, device)).transpose()?,
            smiles: graphs.iter().map(|g| g.smiles.clone().unwrap_or_default()).collect(),
        };
        batch.buckets.validate(n, n_edges)?;
        debug!(molecules = graphs.len(), atoms = n, edges = n_edges, "batch built");
        Ok(batch)
    }

    /// Assemble a batch from prebuilt tensors and buckets.
    pub fn from_tensors(
        x: Tensor,
        pos: Tensor,
        edge_attr: Tensor,
        molecule_ids: Tensor,
        num_molecules: usize,
        buckets: DegreeBuckets,
    ) -> Result<Self> {
        let n = x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("batch x dims failed: {}", e)))?
            .0;
        let (pn, pc) = pos
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("batch pos dims failed: {}", e)))?;
        if pc != 3 {
            return Err(KgnnError::dims("position width", 3, pc));
        }
        if pn != n {
            return Err(KgnnError::dims("position rows", n, pn));
        }
        let e = edge_attr
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("batch edge dims failed: {}", e)))?
            .0;
        if molecule_ids.dtype() != DType::U32 {
            return Err(KgnnError::Configuration("molecule ids must be u32".into()));
        }
        let ids = molecule_ids
            .to_vec1::<u32>()
            .map_err(|e| KgnnError::Tensor(format!("molecule id read failed: {}", e)))?;
        if ids.len() != n {
            return Err(KgnnError::dims("molecule ids", n, ids.len()));
        }
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= num_molecules) {
            return Err(KgnnError::dims("molecule id bound", num_molecules, bad as usize));
        }
        buckets.validate(n, e)?;

        Ok(Self {
            x,
            pos,
            edge_attr,
            molecule_ids,
            num_molecules,
            buckets,
            atomic_numbers: None,
            smiles: vec![String::new(); num_molecules],
        })
    }

    /// Replace the N-hop buckets with caller-defined ones.
    pub fn with_nhop_buckets(mut self, nhop: DegreeBuckets) -> Result<Self> {
        if let Some(bucket) = nhop.iter().find(|b| b.hop != Hop::Multi) {
            return Err(KgnnError::Configuration(format!(
                "{} {} bucket passed as N-hop bucket",
                bucket.hop, bucket.degree
            )));
        }
        self.buckets.remove_hop(Hop::Multi);
        for bucket in nhop.iter() {
            self.buckets.insert(bucket.clone())?;
        }
        self.buckets.validate(self.num_atoms(), self.num_edges())?;
        Ok(self)
    }

    pub fn with_atomic_numbers(mut self, atomic_numbers: Tensor) -> Result<Self> {
        let count = atomic_numbers
            .dims1()
            .map_err(|e| KgnnError::Tensor(format!("atomic number dims failed: {}", e)))?;
        if count != self.num_atoms() {
            return Err(KgnnError::dims("atomic numbers", self.num_atoms(), count));
        }
        self.atomic_numbers = Some(atomic_numbers);
        Ok(self)
    }

    pub fn num_atoms(&self) -> usize {
        self.x.dims().first().copied().unwrap_or(0)
    }

    pub fn num_edges(&self) -> usize {
        self.edge_attr.dims().first().copied().unwrap_or(0)
    }

    pub fn node_feature_dim(&self) -> usize {
        self.x.dims().get(1).copied().unwrap_or(0)
    }

    pub fn edge_feature_dim(&self) -> usize {
        self.edge_attr.dims().get(1).copied().unwrap_or(0)
    }

    /// Same batch with `x` replaced (e.g. by learned atom embeddings).
    pub fn with_node_features(&self, x: Tensor) -> Result<Self> {
        let rows = x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("node feature dims failed: {}", e)))?
            .0;
        if rows != self.num_atoms() {
            return Err(KgnnError::dims("node feature rows", self.num_atoms(), rows));
        }
        Ok(Self { x, ..self.clone() })
    }
}

// ============================================================================
// Network
// ============================================================================

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct GraphOutput {
    /// `(n, output_width)`, row `i` is atom `i`
    pub node_representation: Tensor,
    /// `(num_molecules, graph_embedding_dim)`
    pub graph_embedding: Tensor,
}

/// Edge normalization, kernel encoder and embedding head.
#[derive(Debug)]
pub struct MolKgnnNet {
    config: KgnnConfig,
    edge_norm: Option<BatchNormParams>,
    encoder: GraphEncoder,
    head: GraphEmbeddingHead,
    device: Device,
}

impl MolKgnnNet {
    pub fn new(config: KgnnConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let edge_norm = if config.edge_norm {
            Some(BatchNormParams::new(config.edge_feature_dim, device)?)
        } else {
            None
        };
        let encoder = GraphEncoder::new(&config, device)?;
        let head = GraphEmbeddingHead::new(encoder.out_dim(), config.graph_embedding_dim, config.dropout, device)?;

        let net = Self {
            config,
            edge_norm,
            encoder,
            head,
            device: device.clone(),
        };
        info!(
            layers = net.config.num_layers,
            width = net.encoder.out_dim(),
            embedding = net.config.graph_embedding_dim,
            parameters = net.num_parameters(),
            "MolKgnnNet built"
        );
        Ok(net)
    }

    pub fn config(&self) -> &KgnnConfig {
        &self.config
    }

    pub fn encoder(&self) -> &GraphEncoder {
        &self.encoder
    }

    pub fn head(&self) -> &GraphEmbeddingHead {
        &self.head
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Evaluation-mode forward (dropout off).
    pub fn forward(&self, batch: &MolecularBatch) -> Result<GraphOutput> {
        self.forward_t(batch, false)
    }

    /// Forward pass; `train` enables dropout and updates the edge
    /// normalization's running statistics.
    pub fn forward_t(&self, batch: &MolecularBatch, train: bool) -> Result<GraphOutput> {
        let edge_attr = self.prepare_edges(batch, train)?;
        let node_representation = self
            .encoder
            .forward(&batch.x, &batch.pos, &edge_attr, &batch.buckets)?;
        let graph_embedding =
            self.head
                .forward_t(&node_representation, &batch.molecule_ids, batch.num_molecules, train)?;
        debug!(atoms = batch.num_atoms(), molecules = batch.num_molecules, train, "forward done");
        Ok(GraphOutput {
            node_representation,
            graph_embedding,
        })
    }

    /// Every encoder layer's per-atom output, in evaluation mode.
    pub fn forward_trace(&self, batch: &MolecularBatch) -> Result<EncoderTrace> {
        let edge_attr = self.prepare_edges(batch, false)?;
        self.encoder
            .forward_trace(&batch.x, &batch.pos, &edge_attr, &batch.buckets)
    }

    fn prepare_edges(&self, batch: &MolecularBatch, train: bool) -> Result<Tensor> {
        if batch.node_feature_dim() != self.config.node_feature_dim {
            return Err(KgnnError::dims(
                "batch atom feature width",
                self.config.node_feature_dim,
                batch.node_feature_dim(),
            ));
        }
        // A bond-free batch carries no edge width of its own
        if batch.num_edges() == 0 {
            return Tensor::zeros((0, self.config.edge_feature_dim), DType::F32, batch.x.device())
                .map_err(|e| KgnnError::Tensor(format!("empty edge attr failed: {}", e)));
        }
        if batch.edge_feature_dim() != self.config.edge_feature_dim {
            return Err(KgnnError::dims(
                "batch edge attribute width",
                self.config.edge_feature_dim,
                batch.edge_feature_dim(),
            ));
        }
        match &self.edge_norm {
            Some(params) => batch_norm(&batch.edge_attr, params, train),
            None => Ok(batch.edge_attr.clone()),
        }
    }

    /// Learnable parameters with their bundle names.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        if let Some(norm) = &self.edge_norm {
            vars.push(("edge_norm.gamma".to_string(), norm.affine.gamma.clone()));
            vars.push(("edge_norm.beta".to_string(), norm.affine.beta.clone()));
        }
        vars.extend(self.encoder.named_vars());
        vars.extend(self.head.named_vars());
        vars
    }

    /// Running statistics: persisted, never handed to an optimizer.
    pub fn named_buffers(&self) -> Vec<(String, Var)> {
        match &self.edge_norm {
            Some(norm) => vec![
                ("edge_norm.running_mean".to_string(), norm.running_mean.clone()),
                ("edge_norm.running_var".to_string(), norm.running_var.clone()),
            ],
            None => Vec::new(),
        }
    }

    /// Everything a checkpoint holds: parameters, then buffers.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.named_parameters();
        vars.extend(self.named_buffers());
        vars
    }

    /// Parameters for an external optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.named_parameters().into_iter().map(|(_, v)| v).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum()
    }

    /// Names are unique across the whole network.
    pub fn parameter_names(&self) -> HashSet<String> {
        self.named_vars().into_iter().map(|(n, _)| n).collect()
    }
}
