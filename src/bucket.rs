//! Degree buckets
//!
//! Atoms are partitioned by neighbor count so each partition can be evaluated
//! as one fixed-arity batch. A [`DegreeBucket`] holds, for one (hop, degree)
//! pair:
//!
//! - `selected: (m)`: the output rows (atom indices) this bucket fills
//! - `neighbors: (m, k)`: for each selected atom, the rows of its `k` neighbors
//! - `edges: (m, k)`: the rows of the connecting edges' attribute vectors
//!
//! All three are `u32` tensors so they feed `index_select` / `index_add`
//! directly. Buckets are built and validated once per batch on the host; the
//! forward pass then only gathers and scatters.

use crate::primitives::index_tensor;
use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::fmt;

/// Largest supported neighbor count.
pub const MAX_DEGREE: usize = 4;

/// Neighborhood scope of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hop {
    /// Directly bonded neighbors
    One,
    /// Wider multi-hop neighborhood, supplied by the caller
    Multi,
}

impl Hop {
    /// Processing and concatenation order.
    pub const ALL: [Hop; 2] = [Hop::One, Hop::Multi];

    /// Short name used in parameter and log keys.
    pub fn name(self) -> &'static str {
        match self {
            Hop::One => "1hop",
            Hop::Multi => "nhop",
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A neighbor count in `1..=MAX_DEGREE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Degree(usize);

impl Degree {
    pub const ALL: [Degree; MAX_DEGREE] = [Degree(1), Degree(2), Degree(3), Degree(4)];

    pub fn new(k: usize) -> Result<Self> {
        if k == 0 || k > MAX_DEGREE {
            return Err(KgnnError::DegreeMismatch(format!(
                "degree {} outside supported range 1..={}",
                k, MAX_DEGREE
            )));
        }
        Ok(Self(k))
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Position in per-degree arrays (`degree - 1`).
    pub fn index(self) -> usize {
        self.0 - 1
    }
}

impl fmt::Display for Degree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deg{}", self.0)
    }
}

/// Index tensors of one (hop, degree) partition.
#[derive(Debug, Clone)]
pub struct DegreeBucket {
    pub hop: Hop,
    pub degree: Degree,
    pub selected: Tensor,
    pub neighbors: Tensor,
    pub edges: Tensor,
}

impl DegreeBucket {
    /// Wrap prebuilt index tensors, checking their shapes against `degree`.
    pub fn new(hop: Hop, degree: Degree, selected: Tensor, neighbors: Tensor, edges: Tensor) -> Result<Self> {
        for (name, t) in [("selected", &selected), ("neighbors", &neighbors), ("edges", &edges)] {
            if t.dtype() != DType::U32 {
                return Err(KgnnError::Configuration(format!(
                    "{} {} {} index must be u32, got {:?}",
                    hop,
                    degree,
                    name,
                    t.dtype()
                )));
            }
        }
        let m = selected
            .dims1()
            .map_err(|e| KgnnError::Tensor(format!("selected index dims failed: {}", e)))?;
        let (nm, nk) = neighbors
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("neighbor index dims failed: {}", e)))?;
        if nk != degree.get() {
            return Err(KgnnError::DegreeMismatch(format!(
                "{} {} bucket has {} neighbor columns",
                hop, degree, nk
            )));
        }
        if nm != m {
            return Err(KgnnError::dims(format!("{} {} neighbor rows", hop, degree), m, nm));
        }
        let edge_dims = edges
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("edge index dims failed: {}", e)))?;
        if edge_dims != (nm, nk) {
            return Err(KgnnError::dims(
                format!("{} {} edge index entries", hop, degree),
                nm * nk,
                edge_dims.0 * edge_dims.1,
            ));
        }
        Ok(Self {
            hop,
            degree,
            selected,
            neighbors,
            edges,
        })
    }

    /// Build from host index lists; every row must list exactly `degree` entries.
    pub fn from_indices(
        hop: Hop,
        degree: Degree,
        selected: &[u32],
        neighbors: &[Vec<u32>],
        edges: &[Vec<u32>],
        device: &Device,
    ) -> Result<Self> {
        let k = degree.get();
        let m = selected.len();
        if neighbors.len() != m {
            return Err(KgnnError::dims(format!("{} {} neighbor rows", hop, degree), m, neighbors.len()));
        }
        if edges.len() != m {
            return Err(KgnnError::dims(format!("{} {} edge rows", hop, degree), m, edges.len()));
        }
        for (row, (nbrs, eds)) in neighbors.iter().zip(edges).enumerate() {
            if nbrs.len() != k || eds.len() != k {
                return Err(KgnnError::DegreeMismatch(format!(
                    "atom {} in {} {} bucket lists {} neighbors and {} edges",
                    selected[row],
                    hop,
                    degree,
                    nbrs.len(),
                    eds.len()
                )));
            }
        }

        let selected_t = index_tensor(selected, device)?;
        let flat_n: Vec<u32> = neighbors.iter().flatten().copied().collect();
        let flat_e: Vec<u32> = edges.iter().flatten().copied().collect();
        let neighbors_t = index_tensor(&flat_n, device)?
            .reshape((m, k))
            .map_err(|e| KgnnError::Tensor(format!("neighbor index reshape failed: {}", e)))?;
        let edges_t = index_tensor(&flat_e, device)?
            .reshape((m, k))
            .map_err(|e| KgnnError::Tensor(format!("edge index reshape failed: {}", e)))?;

        Self::new(hop, degree, selected_t, neighbors_t, edges_t)
    }

    /// Number of member atoms.
    pub fn len(&self) -> usize {
        self.selected.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same indices under another hop (used to mirror the bonded neighborhood).
    pub fn with_hop(&self, hop: Hop) -> Self {
        Self { hop, ..self.clone() }
    }

    /// Host copy of the selected atom indices.
    pub fn selected_atoms(&self) -> Result<Vec<u32>> {
        self.selected
            .to_vec1::<u32>()
            .map_err(|e| KgnnError::Tensor(format!("selected index read failed: {}", e)))
    }

    /// Check every index against the batch's atom and edge counts.
    pub fn validate_bounds(&self, num_atoms: usize, num_edges: usize) -> Result<()> {
        let checks = [
            ("selected", &self.selected, num_atoms),
            ("neighbor", &self.neighbors, num_atoms),
            ("edge", &self.edges, num_edges),
        ];
        for (name, t, bound) in checks {
            let values = t
                .flatten_all()
                .and_then(|t| t.to_vec1::<u32>())
                .map_err(|e| KgnnError::Tensor(format!("{} index read failed: {}", name, e)))?;
            if let Some(&bad) = values.iter().find(|&&v| v as usize >= bound) {
                return Err(KgnnError::dims(
                    format!("{} {} {} index bound", self.hop, self.degree, name),
                    bound,
                    bad as usize,
                ));
            }
        }
        Ok(())
    }
}

/// At most one bucket per (hop, degree), iterated 1-hop first then by degree.
#[derive(Debug, Clone, Default)]
pub struct DegreeBuckets {
    buckets: BTreeMap<(Hop, Degree), DegreeBucket>,
}

impl DegreeBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group atoms of one hop by neighbor count.
    ///
    /// `adjacency[i]` lists `(neighbor_atom, edge_row)` for atom `i`. Atoms with
    /// no neighbors stay unbucketed; more than [`MAX_DEGREE`] neighbors is a
    /// [`KgnnError::DegreeMismatch`].
    pub fn from_adjacency(hop: Hop, adjacency: &[Vec<(u32, u32)>], device: &Device) -> Result<Self> {
        let mut grouped: [(Vec<u32>, Vec<Vec<u32>>, Vec<Vec<u32>>); MAX_DEGREE] = Default::default();
        for (atom, nbrs) in adjacency.iter().enumerate() {
            if nbrs.is_empty() {
                continue;
            }
            let degree = Degree::new(nbrs.len()).map_err(|_| {
                KgnnError::DegreeMismatch(format!(
                    "atom {} has {} {} neighbors, maximum is {}",
                    atom,
                    nbrs.len(),
                    hop,
                    MAX_DEGREE
                ))
            })?;
            let slot = &mut grouped[degree.index()];
            slot.0.push(atom as u32);
            slot.1.push(nbrs.iter().map(|&(n, _)| n).collect());
            slot.2.push(nbrs.iter().map(|&(_, e)| e).collect());
        }

        let mut buckets = Self::new();
        for (degree, (selected, neighbors, edges)) in Degree::ALL.into_iter().zip(grouped) {
            if selected.is_empty() {
                continue;
            }
            let bucket = DegreeBucket::from_indices(hop, degree, &selected, &neighbors, &edges, device)?;
            buckets.insert(bucket)?;
        }
        Ok(buckets)
    }

    /// Add a bucket; a second bucket for the same (hop, degree) is rejected.
    pub fn insert(&mut self, bucket: DegreeBucket) -> Result<()> {
        let key = (bucket.hop, bucket.degree);
        if self.buckets.contains_key(&key) {
            return Err(KgnnError::DegreeMismatch(format!(
                "duplicate {} {} bucket",
                bucket.hop, bucket.degree
            )));
        }
        self.buckets.insert(key, bucket);
        Ok(())
    }

    pub fn get(&self, hop: Hop, degree: Degree) -> Option<&DegreeBucket> {
        self.buckets.get(&(hop, degree))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DegreeBucket> {
        self.buckets.values()
    }

    /// Buckets of one hop, by ascending degree.
    pub fn hop(&self, hop: Hop) -> impl Iterator<Item = &DegreeBucket> {
        self.buckets.values().filter(move |b| b.hop == hop)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket of `hop`.
    pub fn remove_hop(&mut self, hop: Hop) {
        self.buckets.retain(|&(h, _), _| h != hop);
    }

    /// Copy the 1-hop buckets into the N-hop slots, replacing existing ones.
    pub fn mirror_bonded_into_nhop(&mut self) {
        self.remove_hop(Hop::Multi);
        let mirrored: Vec<DegreeBucket> = self.hop(Hop::One).map(|b| b.with_hop(Hop::Multi)).collect();
        for bucket in mirrored {
            self.buckets.insert((bucket.hop, bucket.degree), bucket);
        }
    }

    /// Check index bounds and that no atom sits in two buckets of one hop.
    pub fn validate(&self, num_atoms: usize, num_edges: usize) -> Result<()> {
        for hop in Hop::ALL {
            let mut owner: Vec<Option<Degree>> = vec![None; num_atoms];
            for bucket in self.hop(hop) {
                bucket.validate_bounds(num_atoms, num_edges)?;
                for atom in bucket.selected_atoms()? {
                    let slot = &mut owner[atom as usize];
                    if let Some(previous) = slot {
                        return Err(KgnnError::DegreeMismatch(format!(
                            "atom {} appears in {} buckets {} and {}",
                            atom, hop, previous, bucket.degree
                        )));
                    }
                    *slot = Some(bucket.degree);
                }
            }
        }
        Ok(())
    }
}
