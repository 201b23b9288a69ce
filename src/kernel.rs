//! Geometric kernels
//!
//! A [`KernelSet`] is the parameter block for one (hop, degree) pair: `C`
//! kernels evaluated together as column blocks of shared weight matrices.
//! Kernel `c` maps a focal atom and its `k` neighbors to
//!
//! ```text
//! r_c = b_c + Wf_c·x_focal
//!           + Σ_j     tanh(Wn_c·[x_j ‖ e_ij ‖ rbf(d_ij)])
//!           + Σ_{j<l} tanh(Wa_c·abf(cos θ_jl))
//! ```
//!
//! The sums make `r_c` independent of neighbor order. Geometry enters only
//! through [`GeometricBasis`] invariants, so `r_c` is unchanged by rigid
//! motions. Degree-1 sets have no angular weights.
//!
//! [`GeometricKernel`] is a view of one column, for inspecting a single
//! kernel's response to a single [`NeighborFrame`].

use crate::bucket::{Degree, DegreeBucket, Hop};
use crate::geometry::GeometricBasis;
use crate::primitives::{init_std, tanh};
use crate::{KgnnError, Result};
use candle_core::{DType, Device, Tensor, Var};

// ============================================================================
// Frames
// ============================================================================

/// Neighborhoods of `m` focal atoms sharing one degree `k`.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    /// `(m, x_dim)`
    pub focal_x: Tensor,
    /// `(m, 3)`
    pub focal_pos: Tensor,
    /// `(m, k, x_dim)`
    pub neighbor_x: Tensor,
    /// `(m, k, 3)`
    pub neighbor_pos: Tensor,
    /// `(m, k, edge_dim)`
    pub edge_attr: Tensor,
}

impl FrameBatch {
    /// Gather the frames of a bucket's member atoms from whole-batch tensors.
    ///
    /// `x: (n, x_dim)`, `pos: (n, 3)`, `edge_attr: (E, edge_dim)`.
    pub fn gather(x: &Tensor, pos: &Tensor, edge_attr: &Tensor, bucket: &DegreeBucket) -> Result<Self> {
        let m = bucket.len();
        let k = bucket.degree.get();
        let x_dim = x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("gather x dims failed: {}", e)))?
            .1;
        let edge_dim = edge_attr
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("gather edge dims failed: {}", e)))?
            .1;

        let focal_x = x
            .index_select(&bucket.selected, 0)
            .map_err(|e| KgnnError::Tensor(format!("gather focal x failed: {}", e)))?;
        let focal_pos = pos
            .index_select(&bucket.selected, 0)
            .map_err(|e| KgnnError::Tensor(format!("gather focal pos failed: {}", e)))?;

        let flat_nbr = bucket
            .neighbors
            .flatten_all()
            .map_err(|e| KgnnError::Tensor(format!("flatten neighbor index failed: {}", e)))?;
        let flat_edge = bucket
            .edges
            .flatten_all()
            .map_err(|e| KgnnError::Tensor(format!("flatten edge index failed: {}", e)))?;

        let neighbor_x = x
            .index_select(&flat_nbr, 0)
            .and_then(|t| t.reshape((m, k, x_dim)))
            .map_err(|e| KgnnError::Tensor(format!("gather neighbor x failed: {}", e)))?;
        let neighbor_pos = pos
            .index_select(&flat_nbr, 0)
            .and_then(|t| t.reshape((m, k, 3)))
            .map_err(|e| KgnnError::Tensor(format!("gather neighbor pos failed: {}", e)))?;
        let edge_attr = edge_attr
            .index_select(&flat_edge, 0)
            .and_then(|t| t.reshape((m, k, edge_dim)))
            .map_err(|e| KgnnError::Tensor(format!("gather edge attr failed: {}", e)))?;

        Ok(Self {
            focal_x,
            focal_pos,
            neighbor_x,
            neighbor_pos,
            edge_attr,
        })
    }

    pub fn len(&self) -> usize {
        self.focal_x.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One focal atom's neighborhood.
#[derive(Debug, Clone)]
pub struct NeighborFrame {
    /// `(x_dim)`
    pub focal_x: Tensor,
    /// `(3)`
    pub focal_pos: Tensor,
    /// `(k, x_dim)`
    pub neighbor_x: Tensor,
    /// `(k, 3)`
    pub neighbor_pos: Tensor,
    /// `(k, edge_dim)`
    pub edge_attr: Tensor,
}

impl NeighborFrame {
    /// Batch of one.
    pub fn to_batch(&self) -> Result<FrameBatch> {
        let lift = |t: &Tensor, name: &str| {
            t.unsqueeze(0)
                .map_err(|e| KgnnError::Tensor(format!("frame {} unsqueeze failed: {}", name, e)))
        };
        Ok(FrameBatch {
            focal_x: lift(&self.focal_x, "focal_x")?,
            focal_pos: lift(&self.focal_pos, "focal_pos")?,
            neighbor_x: lift(&self.neighbor_x, "neighbor_x")?,
            neighbor_pos: lift(&self.neighbor_pos, "neighbor_pos")?,
            edge_attr: lift(&self.edge_attr, "edge_attr")?,
        })
    }
}

// ============================================================================
// Kernel bank
// ============================================================================

/// Parameters of the kernels for one (hop, degree) pair.
#[derive(Debug)]
pub struct KernelSet {
    pub hop: Hop,
    pub degree: Degree,
    x_dim: usize,
    edge_dim: usize,
    basis_dim: usize,
    /// `(x_dim, C)`
    pub focal_weight: Var,
    /// `(x_dim + edge_dim + R, C)`
    pub neighbor_weight: Var,
    /// `(R, C)`, present for degree >= 2
    pub angle_weight: Option<Var>,
    /// `(C)`
    pub bias: Var,
}

impl KernelSet {
    pub fn new(
        hop: Hop,
        degree: Degree,
        num_kernels: usize,
        x_dim: usize,
        edge_dim: usize,
        basis_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        if num_kernels == 0 {
            return Err(KgnnError::Configuration(format!(
                "{} {} kernel set must hold at least one kernel",
                hop, degree
            )));
        }
        let nbr_in = x_dim + edge_dim + basis_dim;

        let focal_weight = random_var((x_dim, num_kernels), x_dim, device, "focal weight")?;
        let neighbor_weight = random_var((nbr_in, num_kernels), nbr_in, device, "neighbor weight")?;
        let angle_weight = if degree.get() >= 2 {
            Some(random_var((basis_dim, num_kernels), basis_dim, device, "angle weight")?)
        } else {
            None
        };
        let bias = Var::zeros(num_kernels, DType::F32, device)
            .map_err(|e| KgnnError::Tensor(format!("kernel bias init failed: {}", e)))?;

        Ok(Self {
            hop,
            degree,
            x_dim,
            edge_dim,
            basis_dim,
            focal_weight,
            neighbor_weight,
            angle_weight,
            bias,
        })
    }

    pub fn num_kernels(&self) -> usize {
        self.bias.as_tensor().elem_count()
    }

    pub fn x_dim(&self) -> usize {
        self.x_dim
    }

    pub fn edge_dim(&self) -> usize {
        self.edge_dim
    }

    /// Responses of every kernel for every frame, `(m, C)`.
    pub fn evaluate(&self, frames: &FrameBatch, basis: &GeometricBasis) -> Result<Tensor> {
        let angle = self.angle_weight.as_ref().map(|w| w.as_tensor().clone());
        self.respond(
            frames,
            basis,
            self.focal_weight.as_tensor(),
            self.neighbor_weight.as_tensor(),
            angle.as_ref(),
            self.bias.as_tensor(),
        )
    }

    /// View of kernel `index`.
    pub fn kernel(&self, index: usize) -> Result<GeometricKernel<'_>> {
        if index >= self.num_kernels() {
            return Err(KgnnError::dims(
                format!("{} {} kernel index", self.hop, self.degree),
                self.num_kernels(),
                index,
            ));
        }
        Ok(GeometricKernel { set: self, index })
    }

    /// Parameters keyed `{prefix}.{focal_weight|neighbor_weight|angle_weight|bias}`.
    pub fn named_vars(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut vars = vec![
            (format!("{}.focal_weight", prefix), self.focal_weight.clone()),
            (format!("{}.neighbor_weight", prefix), self.neighbor_weight.clone()),
        ];
        if let Some(w) = &self.angle_weight {
            vars.push((format!("{}.angle_weight", prefix), w.clone()));
        }
        vars.push((format!("{}.bias", prefix), self.bias.clone()));
        vars
    }

    fn check_frames(&self, frames: &FrameBatch, basis: &GeometricBasis) -> Result<usize> {
        let ctx = |what: &str| format!("{} {} {}", self.hop, self.degree, what);

        let (m, k, x_dim) = frames
            .neighbor_x
            .dims3()
            .map_err(|e| KgnnError::Tensor(format!("neighbor x dims failed: {}", e)))?;
        if k != self.degree.get() {
            return Err(KgnnError::DegreeMismatch(format!(
                "{} kernels expect {} neighbors per frame, got {}",
                ctx("set"),
                self.degree.get(),
                k
            )));
        }
        if x_dim != self.x_dim {
            return Err(KgnnError::dims(ctx("neighbor feature width"), self.x_dim, x_dim));
        }
        let (fm, fx) = frames
            .focal_x
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("focal x dims failed: {}", e)))?;
        if fx != self.x_dim {
            return Err(KgnnError::dims(ctx("focal feature width"), self.x_dim, fx));
        }
        if fm != m {
            return Err(KgnnError::dims(ctx("focal rows"), m, fm));
        }
        let (em, ek, ed) = frames
            .edge_attr
            .dims3()
            .map_err(|e| KgnnError::Tensor(format!("edge attr dims failed: {}", e)))?;
        if ed != self.edge_dim {
            return Err(KgnnError::dims(ctx("edge attribute width"), self.edge_dim, ed));
        }
        if (em, ek) != (m, k) {
            return Err(KgnnError::dims(ctx("edge attribute entries"), m * k, em * ek));
        }
        if basis.dim() != self.basis_dim {
            return Err(KgnnError::dims(ctx("basis width"), self.basis_dim, basis.dim()));
        }
        Ok(m)
    }

    fn respond(
        &self,
        frames: &FrameBatch,
        basis: &GeometricBasis,
        focal_w: &Tensor,
        neighbor_w: &Tensor,
        angle_w: Option<&Tensor>,
        bias: &Tensor,
    ) -> Result<Tensor> {
        let m = self.check_frames(frames, basis)?;
        let k = self.degree.get();
        let c = bias.elem_count();
        if m == 0 {
            return Tensor::zeros((0, c), DType::F32, bias.device())
                .map_err(|e| KgnnError::Tensor(format!("empty response failed: {}", e)));
        }

        let inv = basis.invariants(&frames.focal_pos, &frames.neighbor_pos)?;

        // Per-neighbor partial responses, summed over the k neighbors
        let nbr_in = Tensor::cat(&[&frames.neighbor_x, &frames.edge_attr, &inv.radial], 2)
            .map_err(|e| KgnnError::Tensor(format!("kernel neighbor cat failed: {}", e)))?;
        let width = nbr_in.dims()[2];
        let partial = nbr_in
            .reshape((m * k, width))
            .and_then(|t| t.matmul(neighbor_w))
            .map_err(|e| KgnnError::Tensor(format!("kernel neighbor matmul failed: {}", e)))?;
        let neighbor_term = tanh(&partial)?
            .reshape((m, k, c))
            .and_then(|t| t.sum(1))
            .map_err(|e| KgnnError::Tensor(format!("kernel neighbor sum failed: {}", e)))?;

        let focal_term = frames
            .focal_x
            .matmul(focal_w)
            .map_err(|e| KgnnError::Tensor(format!("kernel focal matmul failed: {}", e)))?;

        let mut out = (focal_term + neighbor_term)
            .map_err(|e| KgnnError::Tensor(format!("kernel combine failed: {}", e)))?;

        if let Some(angle_w) = angle_w {
            let p = inv.cosines.dims()[1];
            if p > 0 {
                let partial = inv
                    .angular
                    .reshape((m * p, basis.dim()))
                    .and_then(|t| t.matmul(angle_w))
                    .map_err(|e| KgnnError::Tensor(format!("kernel angle matmul failed: {}", e)))?;
                let angle_term = tanh(&partial)?
                    .reshape((m, p, c))
                    .and_then(|t| t.sum(1))
                    .map_err(|e| KgnnError::Tensor(format!("kernel angle sum failed: {}", e)))?;
                out = (out + angle_term)
                    .map_err(|e| KgnnError::Tensor(format!("kernel angle add failed: {}", e)))?;
            }
        }

        out.broadcast_add(bias)
            .map_err(|e| KgnnError::Tensor(format!("kernel bias add failed: {}", e)))
    }
}

fn random_var(shape: (usize, usize), fan_in: usize, device: &Device, what: &str) -> Result<Var> {
    let init = Tensor::randn(0.0f32, init_std(fan_in), shape, device)
        .map_err(|e| KgnnError::Tensor(format!("kernel {} init failed: {}", what, e)))?;
    Var::from_tensor(&init).map_err(|e| KgnnError::Tensor(format!("kernel {} var failed: {}", what, e)))
}

// ============================================================================
// Single kernel view
// ============================================================================

/// One kernel of a [`KernelSet`].
#[derive(Debug, Clone, Copy)]
pub struct GeometricKernel<'a> {
    set: &'a KernelSet,
    index: usize,
}

impl<'a> GeometricKernel<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn degree(&self) -> Degree {
        self.set.degree
    }

    /// Scalar response to one neighborhood.
    pub fn response(&self, frame: &NeighborFrame, basis: &GeometricBasis) -> Result<f32> {
        let column = |v: &Var, name: &str| {
            v.as_tensor()
                .narrow(1, self.index, 1)
                .and_then(|t| t.contiguous())
                .map_err(|e| KgnnError::Tensor(format!("kernel {} column failed: {}", name, e)))
        };
        let focal_w = column(&self.set.focal_weight, "focal")?;
        let neighbor_w = column(&self.set.neighbor_weight, "neighbor")?;
        let angle_w = match &self.set.angle_weight {
            Some(w) => Some(column(w, "angle")?),
            None => None,
        };
        let bias = self
            .set
            .bias
            .as_tensor()
            .narrow(0, self.index, 1)
            .map_err(|e| KgnnError::Tensor(format!("kernel bias column failed: {}", e)))?;

        let out = self
            .set
            .respond(&frame.to_batch()?, basis, &focal_w, &neighbor_w, angle_w.as_ref(), &bias)?;
        out.flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| KgnnError::Tensor(format!("kernel response read failed: {}", e)))?
            .first()
            .copied()
            .ok_or_else(|| KgnnError::Tensor("kernel response is empty".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::tests::{rigid_motion, rotation_matrix};

    fn device() -> Device {
        Device::Cpu
    }

    fn basis() -> GeometricBasis {
        GeometricBasis::new(6, 5.0).unwrap()
    }

    fn t2(rows: &[Vec<f32>]) -> Tensor {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), cols), &device()).unwrap()
    }

    fn frame(positions: &[[f32; 3]], feats: &[Vec<f32>], edges: &[Vec<f32>]) -> NeighborFrame {
        // positions[0] / feats[0] are the focal atom
        let pos: Vec<Vec<f32>> = positions.iter().map(|p| p.to_vec()).collect();
        NeighborFrame {
            focal_x: Tensor::from_vec(feats[0].clone(), feats[0].len(), &device()).unwrap(),
            focal_pos: Tensor::from_vec(pos[0].clone(), 3, &device()).unwrap(),
            neighbor_x: t2(&feats[1..]),
            neighbor_pos: t2(&pos[1..]),
            edge_attr: t2(edges),
        }
    }

    fn sample() -> (Vec<[f32; 3]>, Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let positions = vec![
            [0.0, 0.0, 0.0],
            [1.5, 0.0, 0.1],
            [-0.4, 1.3, 0.0],
            [0.2, -0.6, 1.4],
        ];
        let feats = vec![
            vec![1.0, 0.0, 0.5],
            vec![0.0, 1.0, -0.5],
            vec![0.3, 0.3, 0.3],
            vec![-1.0, 2.0, 0.0],
        ];
        let edges = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]];
        (positions, feats, edges)
    }

    #[test]
    fn test_set_shapes_and_params() {
        let d1 = KernelSet::new(Hop::One, Degree::new(1).unwrap(), 4, 3, 2, 6, &device()).unwrap();
        assert!(d1.angle_weight.is_none());
        assert_eq!(d1.named_vars("k").len(), 3);

        let d3 = KernelSet::new(Hop::Multi, Degree::new(3).unwrap(), 5, 3, 2, 6, &device()).unwrap();
        assert_eq!(d3.num_kernels(), 5);
        assert_eq!(d3.neighbor_weight.as_tensor().dims(), &[11, 5]);
        let names: Vec<String> = d3.named_vars("layers.0.nhop.deg3").into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"layers.0.nhop.deg3.angle_weight".to_string()));

        let (positions, feats, edges) = sample();
        let batch = frame(&positions, &feats, &edges).to_batch().unwrap();
        let out = d3.evaluate(&batch, &basis()).unwrap();
        assert_eq!(out.dims(), &[1, 5]);
    }

    #[test]
    fn test_zero_kernels_rejected() {
        let err = KernelSet::new(Hop::One, Degree::new(2).unwrap(), 0, 3, 2, 6, &device()).unwrap_err();
        assert!(matches!(err, KgnnError::Configuration(_)));
    }

    #[test]
    fn test_neighbor_permutation_invariance() {
        let set = KernelSet::new(Hop::One, Degree::new(3).unwrap(), 6, 3, 2, 6, &device()).unwrap();
        let (positions, feats, edges) = sample();
        let a = set
            .evaluate(&frame(&positions, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        // Reverse the neighbor order, keeping each neighbor's data together
        let perm = [0usize, 3, 1, 2];
        let p_pos: Vec<[f32; 3]> = perm.iter().map(|&i| positions[i]).collect();
        let p_feats: Vec<Vec<f32>> = perm.iter().map(|&i| feats[i].clone()).collect();
        let p_edges: Vec<Vec<f32>> = perm[1..].iter().map(|&i| edges[i - 1].clone()).collect();
        let b = set
            .evaluate(&frame(&p_pos, &p_feats, &p_edges).to_batch().unwrap(), &basis())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_rigid_motion_invariance() {
        let set = KernelSet::new(Hop::One, Degree::new(3).unwrap(), 6, 3, 2, 6, &device()).unwrap();
        let (positions, feats, edges) = sample();
        let a = set
            .evaluate(&frame(&positions, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        let moved = rigid_motion(&positions, rotation_matrix(2.3), [10.0, -4.0, 0.5]);
        let b = set
            .evaluate(&frame(&moved, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_single_kernel_matches_set_column() {
        let set = KernelSet::new(Hop::One, Degree::new(3).unwrap(), 4, 3, 2, 6, &device()).unwrap();
        let (positions, feats, edges) = sample();
        let f = frame(&positions, &feats, &edges);
        let all = set.evaluate(&f.to_batch().unwrap(), &basis()).unwrap().to_vec2::<f32>().unwrap();

        for c in 0..4 {
            let r = set.kernel(c).unwrap().response(&f, &basis()).unwrap();
            assert!((r - all[0][c]).abs() < 1e-5);
        }
        assert!(set.kernel(4).is_err());
    }

    #[test]
    fn test_degree_mismatch() {
        let set = KernelSet::new(Hop::One, Degree::new(2).unwrap(), 4, 3, 2, 6, &device()).unwrap();
        let (positions, feats, edges) = sample();
        let err = set
            .evaluate(&frame(&positions, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap_err();
        assert!(matches!(err, KgnnError::DegreeMismatch(_)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let set = KernelSet::new(Hop::One, Degree::new(3).unwrap(), 4, 5, 2, 6, &device()).unwrap();
        let (positions, feats, edges) = sample();
        let err = set
            .evaluate(&frame(&positions, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap_err();
        assert!(matches!(err, KgnnError::DimensionMismatch { expected: 5, got: 3, .. }));

        let set = KernelSet::new(Hop::One, Degree::new(3).unwrap(), 4, 3, 4, 6, &device()).unwrap();
        let err = set
            .evaluate(&frame(&positions, &feats, &edges).to_batch().unwrap(), &basis())
            .unwrap_err();
        assert!(matches!(err, KgnnError::DimensionMismatch { expected: 4, got: 2, .. }));
    }

    #[test]
    fn test_gather_from_bucket() {
        let x = t2(&[vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]]);
        let pos = t2(&[vec![0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0], vec![2.0, 0.0, 0.0]]);
        let edge_attr = t2(&[vec![10.0], vec![11.0], vec![12.0], vec![13.0]]);
        let bucket = DegreeBucket::from_indices(
            Hop::One,
            Degree::new(2).unwrap(),
            &[1],
            &[vec![0, 2]],
            &[vec![1, 2]],
            &device(),
        )
        .unwrap();

        let frames = FrameBatch::gather(&x, &pos, &edge_attr, &bucket).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames.focal_x.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0]]);
        assert_eq!(
            frames.neighbor_x.to_vec3::<f32>().unwrap(),
            vec![vec![vec![0.0, 0.0], vec![2.0, 2.0]]]
        );
        assert_eq!(
            frames.edge_attr.to_vec3::<f32>().unwrap(),
            vec![vec![vec![11.0], vec![12.0]]]
        );
    }
}
