//! Reference systems with analytically known cluster integrals.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::Cluster;
use crate::bond::{BondFunction, BondMatrix};
use crate::error::{Result, VirialError};

/// Weighted spanning-tree sum Σ_T Π_{(i,j)∈T} (-f_ij) by the matrix-tree
/// theorem. For hard-sphere bonds this is the number of spanning trees of the
/// overlap graph.
pub fn spanning_tree_sum(bonds: &BondMatrix) -> f64 {
    let n = bonds.n_points();
    if n < 2 {
        return 1.0;
    }
    let mut laplacian = DMatrix::<f64>::zeros(n - 1, n - 1);
    for i in 0..n {
        for j in (i + 1)..n {
            let w = -bonds.f(i, j);
            if w == 0.0 {
                continue;
            }
            // row/column 0 removed
            if i > 0 {
                laplacian[(i - 1, i - 1)] += w;
            }
            laplacian[(j - 1, j - 1)] += w;
            if i > 0 {
                laplacian[(i - 1, j - 1)] -= w;
                laplacian[(j - 1, i - 1)] -= w;
            }
        }
    }
    laplacian.determinant()
}

/// Weighted sum over undirected Hamiltonian paths Σ_P Π_{(i,j)∈P} (-f_ij).
pub fn hamiltonian_path_sum(bonds: &BondMatrix) -> f64 {
    let n = bonds.n_points();
    if n < 2 {
        return 1.0;
    }
    let size = 1usize << n;
    // paths[mask * n + end]: directed paths covering `mask` ending at `end`
    let mut paths = vec![0.0; size * n];
    for v in 0..n {
        paths[(1 << v) * n + v] = 1.0;
    }
    for mask in 1..size {
        for end in 0..n {
            let p = paths[mask * n + end];
            if p == 0.0 {
                continue;
            }
            for next in 0..n {
                if mask & (1 << next) != 0 {
                    continue;
                }
                let w = -bonds.f(end, next);
                if w != 0.0 {
                    paths[(mask | (1 << next)) * n + next] += p * w;
                }
            }
        }
    }
    let full = size - 1;
    let directed: f64 = (0..n).map(|end| paths[full * n + end]).sum();
    directed / 2.0
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|k| k as f64).product()
}

/// Tree reference: spanning-tree sum normalised by the n^{n-2} labelled
/// trees.
pub fn tree_value(bonds: &BondMatrix) -> f64 {
    let n = bonds.n_points();
    spanning_tree_sum(bonds) / (n as f64).powi(n as i32 - 2)
}

/// Chain reference: Hamiltonian-path sum normalised by the n!/2 labelled
/// paths.
pub fn chain_value(bonds: &BondMatrix) -> f64 {
    let n = bonds.n_points();
    if n < 2 {
        return 1.0;
    }
    hamiltonian_path_sum(bonds) / (factorial(n) / 2.0)
}

/// Hard-sphere B_n / b^{n-1} with b = 2πσ³/3.
pub fn hard_sphere_reduced(n: usize) -> Option<f64> {
    let value = match n {
        2 => 1.0,
        3 => 5.0 / 8.0,
        4 => {
            2707.0 / 4480.0 + 219.0 * 2f64.sqrt() / (2240.0 * PI)
                - 4131.0 * (1.0f64 / 3.0).acos() / (4480.0 * PI)
        }
        5 => 0.110_252_0,
        6 => 0.038_881_98,
        7 => 0.013_023_54,
        8 => 0.004_183_2,
        _ => return None,
    };
    Some(value)
}

/// B_n = (1 - n) / n! · Γ_n for the biconnected integral Γ_n.
pub fn virial_prefactor(n: usize) -> f64 {
    (1.0 - n as f64) / factorial(n)
}

/// Reference system sampled in box 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReferenceKind {
    /// Full hard-sphere biconnected sum
    #[serde(rename = "hard_sphere")]
    HardSphere { sigma: f64 },
    /// Hard-sphere spanning trees
    #[serde(rename = "tree")]
    Tree { sigma: f64 },
    /// Hard-sphere Hamiltonian chains
    #[serde(rename = "chain")]
    Chain { sigma: f64 },
}

impl ReferenceKind {
    pub fn sigma(&self) -> f64 {
        match *self {
            ReferenceKind::HardSphere { sigma }
            | ReferenceKind::Tree { sigma }
            | ReferenceKind::Chain { sigma } => sigma,
        }
    }

    pub fn bond(&self) -> BondFunction {
        BondFunction::HardSphere { sigma: self.sigma() }
    }

    pub fn cluster(&self, n: usize) -> Result<Cluster> {
        let bond = self.bond();
        match self {
            ReferenceKind::HardSphere { .. } => Cluster::flexible(n, &bond),
            ReferenceKind::Tree { .. } => Cluster::tree(n),
            ReferenceKind::Chain { .. } => Cluster::chain(n),
        }
    }

    /// Exact cluster integral over the n-1 free points.
    pub fn integral(&self, n: usize) -> Result<f64> {
        let sigma = self.sigma();
        if sigma < 0.0 {
            return Err(VirialError::InvalidReference(format!(
                "reference diameter is negative ({sigma})"
            )));
        }
        let value = match self {
            ReferenceKind::HardSphere { .. } => {
                let reduced = hard_sphere_reduced(n).ok_or(VirialError::UnsupportedPoints {
                    n,
                    what: "hard-sphere reference",
                    supported: "2..=8",
                })?;
                let b2 = 2.0 * PI * sigma.powi(3) / 3.0;
                -factorial(n) / (n as f64 - 1.0) * reduced * b2.powi(n as i32 - 1)
            }
            ReferenceKind::Tree { .. } | ReferenceKind::Chain { .. } => {
                (4.0 * PI * sigma.powi(3) / 3.0).powi(n as i32 - 1)
            }
        };
        if value == 0.0 {
            return Err(VirialError::InvalidReference("reference integral is zero".into()));
        }
        if !value.is_finite() {
            return Err(VirialError::InvalidReference(format!(
                "reference integral is not finite ({value})"
            )));
        }
        Ok(value)
    }
}
