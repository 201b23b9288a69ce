//! Degree-bucket convolution
//!
//! [`DegreeBucketConv`] owns one [`KernelSet`] per (hop, degree) pair with a
//! positive kernel count. Its output columns are laid out in fixed blocks:
//!
//! ```text
//! | 1hop deg1 | 1hop deg2 | 1hop deg3 | 1hop deg4 | nhop deg1 | ... | nhop deg4 |
//! ```
//!
//! For every bucket the member atoms' frames are gathered, the matching set is
//! evaluated, and the responses are scattered with `index_add` into the
//! member rows of that block. Rows therefore always line up with input atom
//! order, whatever order buckets list their atoms in. An atom fills only its
//! own degree's block per hop; every other block stays zero. Buckets with no
//! members, and atoms with no bucket, contribute zeros.
//!
//! [`KernelConvLayer`] wraps the convolution with optional row normalization
//! in front and a swish nonlinearity behind.

use crate::bucket::{Degree, DegreeBuckets, Hop};
use crate::config::KgnnConfig;
use crate::geometry::GeometricBasis;
use crate::kernel::{FrameBatch, KernelSet};
use crate::primitives::{layer_norm, swish, LayerNormParams};
use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::BTreeMap;
use tracing::debug;

/// Column block of one (hop, degree) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankSlot {
    pub hop: Hop,
    pub degree: Degree,
    pub offset: usize,
    pub width: usize,
}

/// Kernel banks of one layer, dispatched by degree bucket.
#[derive(Debug)]
pub struct DegreeBucketConv {
    in_dim: usize,
    edge_dim: usize,
    out_dim: usize,
    basis: GeometricBasis,
    layout: Vec<BankSlot>,
    sets: BTreeMap<(Hop, Degree), KernelSet>,
}

impl DegreeBucketConv {
    pub fn new(config: &KgnnConfig, in_dim: usize, device: &Device) -> Result<Self> {
        let basis = GeometricBasis::from_config(config)?;
        let mut layout = Vec::with_capacity(Hop::ALL.len() * Degree::ALL.len());
        let mut sets = BTreeMap::new();
        let mut offset = 0;

        for hop in Hop::ALL {
            for degree in Degree::ALL {
                let width = config.kernel_count(hop, degree);
                layout.push(BankSlot {
                    hop,
                    degree,
                    offset,
                    width,
                });
                offset += width;
                if width > 0 {
                    let set = KernelSet::new(
                        hop,
                        degree,
                        width,
                        in_dim,
                        config.edge_feature_dim,
                        basis.dim(),
                        device,
                    )?;
                    sets.insert((hop, degree), set);
                }
            }
        }
        if offset == 0 {
            return Err(KgnnError::Configuration(
                "degree-bucket convolution has no kernels".into(),
            ));
        }

        Ok(Self {
            in_dim,
            edge_dim: config.edge_feature_dim,
            out_dim: offset,
            basis,
            layout,
            sets,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn layout(&self) -> &[BankSlot] {
        &self.layout
    }

    /// Column block of one (hop, degree) pair.
    pub fn slot(&self, hop: Hop, degree: Degree) -> Option<BankSlot> {
        self.layout
            .iter()
            .find(|s| s.hop == hop && s.degree == degree)
            .copied()
    }

    pub fn kernel_set(&self, hop: Hop, degree: Degree) -> Option<&KernelSet> {
        self.sets.get(&(hop, degree))
    }

    /// Per-atom responses `(n, out_dim)`, row `i` belonging to atom `i`.
    ///
    /// `x: (n, in_dim)`, `pos: (n, 3)`, `edge_attr: (E, edge_dim)`. Buckets
    /// are checked first: an out-of-range index is a `DimensionMismatch`, an
    /// atom in two buckets of one hop a `DegreeMismatch`.
    pub fn forward(&self, x: &Tensor, pos: &Tensor, edge_attr: &Tensor, buckets: &DegreeBuckets) -> Result<Tensor> {
        let (n, x_dim) = x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("conv x dims failed: {}", e)))?;
        if x_dim != self.in_dim {
            return Err(KgnnError::dims("conv atom feature width", self.in_dim, x_dim));
        }
        let (pn, pc) = pos
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("conv pos dims failed: {}", e)))?;
        if pc != 3 {
            return Err(KgnnError::dims("conv position width", 3, pc));
        }
        if pn != n {
            return Err(KgnnError::dims("conv position rows", n, pn));
        }
        let (num_edges, edge_dim) = edge_attr
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("conv edge dims failed: {}", e)))?;
        if edge_dim != self.edge_dim {
            return Err(KgnnError::dims("conv edge attribute width", self.edge_dim, edge_dim));
        }
        buckets.validate(n, num_edges)?;

        let mut blocks = Vec::with_capacity(self.layout.len());
        for slot in &self.layout {
            if slot.width == 0 {
                continue;
            }
            let mut block = Tensor::zeros((n, slot.width), DType::F32, x.device())
                .map_err(|e| KgnnError::Tensor(format!("conv block init failed: {}", e)))?;

            match (buckets.get(slot.hop, slot.degree), self.sets.get(&(slot.hop, slot.degree))) {
                (Some(bucket), Some(set)) if !bucket.is_empty() => {
                    let frames = FrameBatch::gather(x, pos, edge_attr, bucket)?;
                    let responses = set.evaluate(&frames, &self.basis)?;
                    block = block
                        .index_add(&bucket.selected, &responses, 0)
                        .map_err(|e| KgnnError::Tensor(format!("conv scatter failed: {}", e)))?;
                    debug!(hop = %slot.hop, degree = %slot.degree, atoms = bucket.len(), "bucket evaluated");
                }
                _ => {
                    debug!(hop = %slot.hop, degree = %slot.degree, "empty bucket skipped");
                }
            }
            blocks.push(block);
        }

        Tensor::cat(&blocks, 1).map_err(|e| KgnnError::Tensor(format!("conv block cat failed: {}", e)))
    }

    /// Parameters keyed `{prefix}.{hop}.{degree}.*`.
    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        self.sets
            .iter()
            .flat_map(|((hop, degree), set)| set.named_vars(&format!("{}.{}.{}", prefix, hop, degree)))
            .collect()
    }
}

/// One encoder layer: row norm, degree-bucket convolution, swish.
#[derive(Debug)]
pub struct KernelConvLayer {
    norm: Option<LayerNormParams>,
    conv: DegreeBucketConv,
    residual: bool,
}

impl KernelConvLayer {
    pub fn new(config: &KgnnConfig, in_dim: usize, device: &Device) -> Result<Self> {
        let conv = DegreeBucketConv::new(config, in_dim, device)?;
        let norm = if config.node_norm {
            Some(LayerNormParams::new(in_dim, device)?)
        } else {
            None
        };
        let residual = config.residual && in_dim == conv.out_dim();
        Ok(Self {
            norm,
            conv,
            residual,
        })
    }

    pub fn conv(&self) -> &DegreeBucketConv {
        &self.conv
    }

    pub fn in_dim(&self) -> usize {
        self.conv.in_dim()
    }

    pub fn out_dim(&self) -> usize {
        self.conv.out_dim()
    }

    pub fn has_residual(&self) -> bool {
        self.residual
    }

    pub fn forward(&self, x: &Tensor, pos: &Tensor, edge_attr: &Tensor, buckets: &DegreeBuckets) -> Result<Tensor> {
        let h = match &self.norm {
            Some(params) => layer_norm(x, params)?,
            None => x.clone(),
        };
        let out = swish(&self.conv.forward(&h, pos, edge_attr, buckets)?)?;
        if self.residual {
            (out + x).map_err(|e| KgnnError::Tensor(format!("layer residual failed: {}", e)))
        } else {
            Ok(out)
        }
    }

    /// Parameters keyed `{prefix}.norm.{gamma|beta}` and `{prefix}.{hop}.{degree}.*`.
    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = Vec::new();
        if let Some(norm) = &self.norm {
            vars.push((format!("{}.norm.gamma", prefix), norm.gamma.clone()));
            vars.push((format!("{}.norm.beta", prefix), norm.beta.clone()));
        }
        vars.extend(self.conv.named_vars(prefix));
        vars
    }
}
