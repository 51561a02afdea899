use serde::{Deserialize, Serialize};

/// Separations below this are treated as complete overlap.
const MIN_R2: f64 = 1e-24;

pub trait PairPotential {
    /// Pair energy at squared separation `r2`; `+∞` for hard overlap.
    fn energy(&self, r2: f64) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LennardJones {
    pub epsilon: f64,
    pub sigma: f64,
    /// Truncation distance, unshifted; `None` keeps the full tail
    pub cutoff: Option<f64>,
}

impl LennardJones {
    pub fn new(epsilon: f64, sigma: f64) -> Self {
        LennardJones {
            epsilon,
            sigma,
            cutoff: None,
        }
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    fn lj_potential(&self, r2: f64) -> f64 {
        let inv_r2 = self.sigma * self.sigma / r2;
        let inv_r6 = inv_r2 * inv_r2 * inv_r2;
        4.0 * self.epsilon * (inv_r6 * inv_r6 - inv_r6)
    }
}

impl PairPotential for LennardJones {
    fn energy(&self, r2: f64) -> f64 {
        if r2 < MIN_R2 {
            return f64::INFINITY;
        }
        if let Some(rc) = self.cutoff {
            if r2 > rc * rc {
                return 0.0;
            }
        }
        let u = self.lj_potential(r2);
        // inf - inf at tiny separations
        if u.is_nan() {
            f64::INFINITY
        } else {
            u
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardSphere {
    pub sigma: f64,
}

impl PairPotential for HardSphere {
    fn energy(&self, r2: f64) -> f64 {
        if r2 < self.sigma * self.sigma {
            f64::INFINITY
        } else {
            0.0
        }
    }
}

/// Hard core of diameter `sigma` with an attractive well of depth `epsilon`
/// out to `lambda * sigma`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SquareWell {
    pub sigma: f64,
    pub lambda: f64,
    pub epsilon: f64,
}

impl SquareWell {
    pub fn in_core(&self, r2: f64) -> bool {
        r2 < self.sigma * self.sigma
    }

    pub fn in_well(&self, r2: f64) -> bool {
        let outer = self.lambda * self.sigma;
        !self.in_core(r2) && r2 < outer * outer
    }
}

impl PairPotential for SquareWell {
    fn energy(&self, r2: f64) -> f64 {
        if self.in_core(r2) {
            f64::INFINITY
        } else if self.in_well(r2) {
            -self.epsilon
        } else {
            0.0
        }
    }
}

/// Closed set of pair potentials a run can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Potential {
    #[serde(rename = "lennard_jones")]
    LennardJones(LennardJones),
    #[serde(rename = "hard_sphere")]
    HardSphere(HardSphere),
    #[serde(rename = "square_well")]
    SquareWell(SquareWell),
}

impl PairPotential for Potential {
    fn energy(&self, r2: f64) -> f64 {
        match self {
            Potential::LennardJones(p) => p.energy(r2),
            Potential::HardSphere(p) => p.energy(r2),
            Potential::SquareWell(p) => p.energy(r2),
        }
    }
}

/// Axilrod-Teller triple-dipole interaction
///
/// u = ν (1 + 3 cos θ₁ cos θ₂ cos θ₃) / (r₁₂ r₁₃ r₂₃)³
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxilrodTeller {
    pub nu: f64,
}

impl AxilrodTeller {
    /// Energy from the three squared side lengths of the triangle.
    pub fn energy(&self, r12sq: f64, r13sq: f64, r23sq: f64) -> f64 {
        if r12sq < MIN_R2 || r13sq < MIN_R2 || r23sq < MIN_R2 {
            return 0.0;
        }
        // law of cosines at each vertex
        let c1 = (r12sq + r13sq - r23sq) / (2.0 * (r12sq * r13sq).sqrt());
        let c2 = (r12sq + r23sq - r13sq) / (2.0 * (r12sq * r23sq).sqrt());
        let c3 = (r13sq + r23sq - r12sq) / (2.0 * (r13sq * r23sq).sqrt());
        let prod = r12sq * r13sq * r23sq;
        self.nu * (1.0 + 3.0 * c1 * c2 * c3) / (prod * prod.sqrt())
    }
}
