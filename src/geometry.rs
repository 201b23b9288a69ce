//! Rigid-motion invariant geometry
//!
//! Kernels never see raw coordinates. For each focal atom and its `k`
//! neighbors this module derives:
//!
//! - the focal→neighbor distances, expanded in `geometric_dim` Gaussians on
//!   `[0, cutoff]` (radial basis)
//! - the cosine of the angle between every unordered pair of focal→neighbor
//!   directions, expanded in `geometric_dim` Gaussians on `[-1, 1]` (angular
//!   basis)
//!
//! Both depend only on `neighbor_position - focal_position` through norms and
//! dot products, so they are unchanged by any rotation or translation of the
//! molecule. Pair order follows [`pair_indices`], and every consumer sums over
//! pairs, so neighbor order does not leak either.

use crate::config::KgnnConfig;
use crate::{KgnnError, Result};
use candle_core::{Device, Tensor, D};

const DIST_EPS: f64 = 1e-8;

/// Unordered neighbor pairs `(j, l)` with `j < l` for a frame of `degree` neighbors.
pub fn pair_indices(degree: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(degree * degree.saturating_sub(1) / 2);
    for j in 0..degree {
        for l in (j + 1)..degree {
            pairs.push((j, l));
        }
    }
    pairs
}

/// Invariant features of a batch of `m` neighbor frames of degree `k`.
#[derive(Debug, Clone)]
pub struct InvariantFeatures {
    /// Focal→neighbor distances `(m, k)`
    pub distances: Tensor,
    /// Radial basis expansion `(m, k, R)`
    pub radial: Tensor,
    /// Pairwise direction cosines `(m, P)`, `P = k(k-1)/2`
    pub cosines: Tensor,
    /// Angular basis expansion `(m, P, R)`
    pub angular: Tensor,
}

/// Gaussian expansions of distances and angles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricBasis {
    geometric_dim: usize,
    cutoff: f32,
}

impl GeometricBasis {
    pub fn new(geometric_dim: usize, cutoff: f32) -> Result<Self> {
        if geometric_dim == 0 {
            return Err(KgnnError::Configuration("geometric_dim must be positive".into()));
        }
        if !(cutoff.is_finite() && cutoff > 0.0) {
            return Err(KgnnError::Configuration(format!(
                "cutoff must be positive, got {}",
                cutoff
            )));
        }
        Ok(Self {
            geometric_dim,
            cutoff,
        })
    }

    pub fn from_config(config: &KgnnConfig) -> Result<Self> {
        Self::new(config.geometric_dim, config.cutoff)
    }

    pub fn dim(&self) -> usize {
        self.geometric_dim
    }

    pub fn cutoff(&self) -> f32 {
        self.cutoff
    }

    /// Relative geometry of `m` frames.
    ///
    /// `focal_pos: (m, 3)`, `neighbor_pos: (m, k, 3)`; returns distances
    /// `(m, k)` and unit direction vectors `(m, k, 3)`.
    pub fn relative_geometry(&self, focal_pos: &Tensor, neighbor_pos: &Tensor) -> Result<(Tensor, Tensor)> {
        let (m, _k, c) = neighbor_pos
            .dims3()
            .map_err(|e| KgnnError::Tensor(format!("neighbor positions dims failed: {}", e)))?;
        if c != 3 {
            return Err(KgnnError::dims("neighbor positions", 3, c));
        }
        let (fm, fc) = focal_pos
            .dims2()
            .map_err(|e| KgnnError::Tensor(format!("focal positions dims failed: {}", e)))?;
        if fc != 3 {
            return Err(KgnnError::dims("focal positions", 3, fc));
        }
        if fm != m {
            return Err(KgnnError::dims("focal position rows", m, fm));
        }

        let rel = focal_pos
            .unsqueeze(1)
            .and_then(|f| neighbor_pos.broadcast_sub(&f))
            .map_err(|e| KgnnError::Tensor(format!("relative position failed: {}", e)))?;
        let dist = rel
            .sqr()
            .and_then(|t| t.sum(D::Minus1))
            .and_then(|t| t.affine(1.0, DIST_EPS))
            .and_then(|t| t.sqrt())
            .map_err(|e| KgnnError::Tensor(format!("distance failed: {}", e)))?;
        let unit = dist
            .unsqueeze(D::Minus1)
            .and_then(|d| rel.broadcast_div(&d))
            .map_err(|e| KgnnError::Tensor(format!("unit direction failed: {}", e)))?;

        Ok((dist, unit))
    }

    /// Cosines between every pair of direction vectors, `(m, k, 3) -> (m, P)`.
    pub fn neighbor_cosines(&self, unit: &Tensor) -> Result<Tensor> {
        let (m, k, _) = unit
            .dims3()
            .map_err(|e| KgnnError::Tensor(format!("unit dims failed: {}", e)))?;
        let pairs = pair_indices(k);
        if pairs.is_empty() {
            return Tensor::zeros((m, 0), unit.dtype(), unit.device())
                .map_err(|e| KgnnError::Tensor(format!("empty cosines failed: {}", e)));
        }

        let (left, right): (Vec<u32>, Vec<u32>) =
            pairs.iter().map(|&(j, l)| (j as u32, l as u32)).unzip();
        let left = crate::primitives::index_tensor(&left, unit.device())?;
        let right = crate::primitives::index_tensor(&right, unit.device())?;

        let a = unit
            .index_select(&left, 1)
            .map_err(|e| KgnnError::Tensor(format!("cosine gather left failed: {}", e)))?;
        let b = unit
            .index_select(&right, 1)
            .map_err(|e| KgnnError::Tensor(format!("cosine gather right failed: {}", e)))?;
        (a * b)
            .and_then(|t| t.sum(D::Minus1))
            .map_err(|e| KgnnError::Tensor(format!("cosine dot failed: {}", e)))
    }

    /// Radial basis on `[0, cutoff]`, appending a trailing axis of width R.
    pub fn radial_basis(&self, distances: &Tensor) -> Result<Tensor> {
        self.gaussian_expand(distances, 0.0, self.cutoff, "radial basis")
    }

    /// Angular basis on `[-1, 1]`, appending a trailing axis of width R.
    pub fn angular_basis(&self, cosines: &Tensor) -> Result<Tensor> {
        self.gaussian_expand(cosines, -1.0, 1.0, "angular basis")
    }

    /// All invariant features of `m` frames in one call.
    pub fn invariants(&self, focal_pos: &Tensor, neighbor_pos: &Tensor) -> Result<InvariantFeatures> {
        let (distances, unit) = self.relative_geometry(focal_pos, neighbor_pos)?;
        let radial = self.radial_basis(&distances)?;
        let cosines = self.neighbor_cosines(&unit)?;
        let angular = self.angular_basis(&cosines)?;
        Ok(InvariantFeatures {
            distances,
            radial,
            cosines,
            angular,
        })
    }

    fn gaussian_expand(&self, values: &Tensor, low: f32, high: f32, step: &str) -> Result<Tensor> {
        let r = self.geometric_dim;
        let spacing = if r > 1 {
            (high - low) / (r - 1) as f32
        } else {
            high - low
        };
        let gamma = 0.5 / (spacing * spacing) as f64;

        let centers = gaussian_centers(r, low, high, values.device())?;
        values
            .unsqueeze(D::Minus1)
            .and_then(|v| v.broadcast_sub(&centers))
            .and_then(|t| t.sqr())
            .and_then(|t| t.affine(-gamma, 0.0))
            .and_then(|t| t.exp())
            .map_err(|e| KgnnError::Tensor(format!("{} failed: {}", step, e)))
    }
}

fn gaussian_centers(r: usize, low: f32, high: f32, device: &Device) -> Result<Tensor> {
    let centers: Vec<f32> = if r == 1 {
        vec![low]
    } else {
        (0..r)
            .map(|i| low + (high - low) * i as f32 / (r - 1) as f32)
            .collect()
    };
    Tensor::from_vec(centers, r, device)
        .map_err(|e| KgnnError::Tensor(format!("basis centers failed: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    /// Rotation about the axis (1, 1, 1)/√3 by `angle`, row-major.
    pub(crate) fn rotation_matrix(angle: f32) -> [[f32; 3]; 3] {
        let (s, c) = angle.sin_cos();
        let u = 1.0 / 3.0f32.sqrt();
        let t = 1.0 - c;
        [
            [c + u * u * t, u * u * t - u * s, u * u * t + u * s],
            [u * u * t + u * s, c + u * u * t, u * u * t - u * s],
            [u * u * t - u * s, u * u * t + u * s, c + u * u * t],
        ]
    }

    /// Apply `rot` then `shift` to a list of points.
    pub(crate) fn rigid_motion(points: &[[f32; 3]], rot: [[f32; 3]; 3], shift: [f32; 3]) -> Vec<[f32; 3]> {
        points
            .iter()
            .map(|p| {
                let mut out = [0.0f32; 3];
                for (i, row) in rot.iter().enumerate() {
                    out[i] = row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + shift[i];
                }
                out
            })
            .collect()
    }

    fn frame(focal: [f32; 3], neighbors: &[[f32; 3]]) -> (Tensor, Tensor) {
        let f = Tensor::from_vec(focal.to_vec(), (1, 3), &device()).unwrap();
        let flat: Vec<f32> = neighbors.iter().flatten().copied().collect();
        let n = Tensor::from_vec(flat, (1, neighbors.len(), 3), &device()).unwrap();
        (f, n)
    }

    #[test]
    fn test_pair_indices() {
        assert!(pair_indices(1).is_empty());
        assert_eq!(pair_indices(2), vec![(0, 1)]);
        assert_eq!(pair_indices(3), vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(pair_indices(4).len(), 6);
    }

    #[test]
    fn test_distances_and_cosines() {
        let basis = GeometricBasis::new(4, 5.0).unwrap();
        let (f, n) = frame([1.0, 1.0, 1.0], &[[2.0, 1.0, 1.0], [1.0, 3.0, 1.0], [0.0, 1.0, 1.0]]);

        let (dist, unit) = basis.relative_geometry(&f, &n).unwrap();
        let dist = dist.to_vec2::<f32>().unwrap();
        assert!((dist[0][0] - 1.0).abs() < 1e-4);
        assert!((dist[0][1] - 2.0).abs() < 1e-4);

        let cos = basis.neighbor_cosines(&unit).unwrap().to_vec2::<f32>().unwrap();
        // (0,1) perpendicular, (0,2) opposite, (1,2) perpendicular
        assert!(cos[0][0].abs() < 1e-4);
        assert!((cos[0][1] + 1.0).abs() < 1e-4);
        assert!(cos[0][2].abs() < 1e-4);
    }

    #[test]
    fn test_degree_one_has_no_angles() {
        let basis = GeometricBasis::new(3, 5.0).unwrap();
        let (f, n) = frame([0.0, 0.0, 0.0], &[[1.5, 0.0, 0.0]]);

        let inv = basis.invariants(&f, &n).unwrap();
        assert_eq!(inv.cosines.dims(), &[1, 0]);
        assert_eq!(inv.angular.dims(), &[1, 0, 3]);
        assert_eq!(inv.radial.dims(), &[1, 1, 3]);
    }

    #[test]
    fn test_radial_basis_peaks_at_centers() {
        let basis = GeometricBasis::new(6, 5.0).unwrap();
        let d = Tensor::from_vec(vec![0.0f32, 5.0], 2, &device()).unwrap();
        let rbf = basis.radial_basis(&d).unwrap().to_vec2::<f32>().unwrap();

        assert!((rbf[0][0] - 1.0).abs() < 1e-6);
        assert!((rbf[1][5] - 1.0).abs() < 1e-6);
        assert!(rbf[0][5] < 1e-3);
    }

    #[test]
    fn test_single_center_basis() {
        let basis = GeometricBasis::new(1, 2.0).unwrap();
        let d = Tensor::from_vec(vec![0.0f32], 1, &device()).unwrap();
        let rbf = basis.radial_basis(&d).unwrap().to_vec2::<f32>().unwrap();
        assert!((rbf[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_invariants_under_rigid_motion() {
        let basis = GeometricBasis::new(8, 5.0).unwrap();
        let focal = [0.3f32, -0.2, 0.5];
        let neighbors = [[1.4f32, 0.1, 0.4], [-0.5, 1.1, 0.2], [0.2, -0.4, 1.7]];

        let (f, n) = frame(focal, &neighbors);
        let a = basis.invariants(&f, &n).unwrap();

        let rot = rotation_matrix(1.1);
        let shift = [3.0, -7.0, 2.5];
        let moved_focal = rigid_motion(&[focal], rot, shift)[0];
        let moved_neighbors = rigid_motion(&neighbors, rot, shift);
        let (f, n) = frame(moved_focal, &moved_neighbors);
        let b = basis.invariants(&f, &n).unwrap();

        let ra: Vec<f32> = a.radial.flatten_all().unwrap().to_vec1().unwrap();
        let rb: Vec<f32> = b.radial.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in ra.iter().zip(&rb) {
            assert!((x - y).abs() < 1e-4);
        }
        let aa: Vec<f32> = a.angular.flatten_all().unwrap().to_vec1().unwrap();
        let ab: Vec<f32> = b.angular.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in aa.iter().zip(&ab) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_shape_validation() {
        let basis = GeometricBasis::new(4, 5.0).unwrap();
        let f = Tensor::zeros((2, 3), candle_core::DType::F32, &device()).unwrap();
        let n = Tensor::zeros((1, 2, 3), candle_core::DType::F32, &device()).unwrap();
        assert!(matches!(
            basis.relative_geometry(&f, &n),
            Err(KgnnError::DimensionMismatch { .. })
        ));

        assert!(GeometricBasis::new(0, 5.0).is_err());
        assert!(GeometricBasis::new(4, -1.0).is_err());
    }
}
