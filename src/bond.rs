//! Bond functions and the per-configuration bond value matrix.
//!
//! A bond function turns a squared separation and an inverse temperature
//! into the Mayer value f = exp(-βu) - 1 of a pair. Square-well bonds can be
//! kept split into a core part and a formal well variable x = exp(βε) - 1,
//! so that a single evaluation yields every power of x separately.

use crate::geometry::Configuration;
use crate::potential::{AxilrodTeller, PairPotential, Potential, SquareWell};

/// Mayer bond written as `constant + linear * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondValue {
    pub constant: f64,
    pub linear: f64,
}

impl BondValue {
    pub const ZERO: BondValue = BondValue {
        constant: 0.0,
        linear: 0.0,
    };

    pub fn scalar(value: f64) -> Self {
        BondValue {
            constant: value,
            linear: 0.0,
        }
    }

    /// Value at a given well variable.
    pub fn at(&self, x: f64) -> f64 {
        self.constant + self.linear * x
    }

    pub fn is_zero(&self) -> bool {
        self.constant == 0.0 && self.linear == 0.0
    }
}

/// Topological class of a pair, used to build bin keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeClass {
    Unbonded,
    /// Repulsive or overlapping pair (f < 0)
    Core,
    /// Attractive pair (f > 0, or a split well bond)
    Well,
}

impl EdgeClass {
    pub fn of(bond: &BondValue) -> Self {
        if bond.linear != 0.0 || bond.constant > 0.0 {
            EdgeClass::Well
        } else if bond.constant < 0.0 {
            EdgeClass::Core
        } else {
            EdgeClass::Unbonded
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BondFunction {
    /// f = exp(-βu) - 1 for an arbitrary pair potential
    Mayer(Potential),
    /// Hard-sphere overlap: exactly -1 inside `sigma`, 0 outside
    HardSphere { sigma: f64 },
    /// Square well with the well contribution kept as the formal variable x
    SquareWellSplit(SquareWell),
}

impl BondFunction {
    /// Scalar Mayer value.
    pub fn value(&self, r2: f64, beta: f64) -> f64 {
        self.bond(r2, beta).at(self.well_variable(beta))
    }

    pub fn bond(&self, r2: f64, beta: f64) -> BondValue {
        debug_assert!(r2 >= 0.0, "negative squared separation {r2}");
        match self {
            BondFunction::Mayer(potential) => {
                let u = potential.energy(r2);
                if u == f64::INFINITY {
                    BondValue::scalar(-1.0)
                } else {
                    BondValue::scalar((-beta * u).exp() - 1.0)
                }
            }
            BondFunction::HardSphere { sigma } => {
                if r2 < sigma * sigma {
                    BondValue::scalar(-1.0)
                } else {
                    BondValue::ZERO
                }
            }
            BondFunction::SquareWellSplit(sw) => {
                if sw.in_core(r2) {
                    BondValue::scalar(-1.0)
                } else if sw.in_well(r2) {
                    BondValue {
                        constant: 0.0,
                        linear: 1.0,
                    }
                } else {
                    BondValue::ZERO
                }
            }
        }
    }

    /// Reduced pair energy βu, `+∞` for hard overlap.
    pub fn energy_value(&self, r2: f64, beta: f64) -> f64 {
        let u = match self {
            BondFunction::Mayer(potential) => potential.energy(r2),
            BondFunction::HardSphere { sigma } => {
                if r2 < sigma * sigma {
                    f64::INFINITY
                } else {
                    0.0
                }
            }
            BondFunction::SquareWellSplit(sw) => sw.energy(r2),
        };
        if u == 0.0 {
            0.0
        } else {
            beta * u
        }
    }

    /// x = exp(βε) - 1 for split square wells, 0 otherwise.
    pub fn well_variable(&self, beta: f64) -> f64 {
        match self {
            BondFunction::SquareWellSplit(sw) => (beta * sw.epsilon).exp() - 1.0,
            _ => 0.0,
        }
    }

    /// Number of per-order values a biconnected sum over `n` points carries.
    pub fn polynomial_orders(&self, n: usize) -> usize {
        match self {
            BondFunction::SquareWellSplit(_) => n * (n.saturating_sub(1)) / 2 + 1,
            _ => 1,
        }
    }
}

/// Three-body Mayer function f₁₂₃ = exp(-βu₁₂₃) - 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletFunction {
    pub potential: AxilrodTeller,
}

impl TripletFunction {
    pub fn value(&self, r12sq: f64, r13sq: f64, r23sq: f64, beta: f64) -> f64 {
        (-beta * self.potential.energy(r12sq, r13sq, r23sq)).exp() - 1.0
    }
}

/// Bond values for every pair (and optionally every triplet) of one
/// configuration. Values are pure functions of the positions and β.
#[derive(Debug, Clone, PartialEq)]
pub struct BondMatrix {
    n: usize,
    bonds: Vec<BondValue>,
    beta_u: Vec<f64>,
    triplets: Option<Vec<f64>>,
    well_variable: f64,
}

impl BondMatrix {
    pub fn compute(
        bond: &BondFunction,
        triplet: Option<&TripletFunction>,
        beta: f64,
        config: &Configuration,
    ) -> Self {
        let n = config.len();
        let mut matrix = BondMatrix {
            n,
            bonds: vec![BondValue::ZERO; n * n],
            beta_u: vec![0.0; n * n],
            triplets: triplet.map(|_| vec![0.0; n * n * n]),
            well_variable: bond.well_variable(beta),
        };
        for i in 0..n {
            for j in (i + 1)..n {
                matrix.set_pair(bond, beta, config, i, j);
            }
        }
        if let Some(t) = triplet {
            for i in 0..n {
                for j in (i + 1)..n {
                    for k in (j + 1)..n {
                        matrix.set_triplet(t, beta, config, i, j, k);
                    }
                }
            }
        }
        matrix
    }

    /// Recompute every pair and triplet touching one of the `moved` points.
    pub fn update(
        &mut self,
        bond: &BondFunction,
        triplet: Option<&TripletFunction>,
        beta: f64,
        config: &Configuration,
        moved: &[usize],
    ) {
        debug_assert_eq!(config.len(), self.n);
        for &i in moved {
            for j in 0..self.n {
                if j != i {
                    self.set_pair(bond, beta, config, i.min(j), i.max(j));
                }
            }
        }
        if let Some(t) = triplet {
            for &m in moved {
                for a in 0..self.n {
                    for b in (a + 1)..self.n {
                        if a == m || b == m {
                            continue;
                        }
                        let mut idx = [m, a, b];
                        idx.sort_unstable();
                        self.set_triplet(t, beta, config, idx[0], idx[1], idx[2]);
                    }
                }
            }
        }
    }

    fn set_pair(&mut self, bond: &BondFunction, beta: f64, config: &Configuration, i: usize, j: usize) {
        let r2 = config.distance2(i, j);
        let value = bond.bond(r2, beta);
        let beta_u = bond.energy_value(r2, beta);
        let n = self.n;
        self.bonds[i * n + j] = value;
        self.bonds[j * n + i] = value;
        self.beta_u[i * n + j] = beta_u;
        self.beta_u[j * n + i] = beta_u;
    }

    fn set_triplet(
        &mut self,
        t: &TripletFunction,
        beta: f64,
        config: &Configuration,
        i: usize,
        j: usize,
        k: usize,
    ) {
        let value = t.value(
            config.distance2(i, j),
            config.distance2(i, k),
            config.distance2(j, k),
            beta,
        );
        let n = self.n;
        if let Some(triplets) = self.triplets.as_mut() {
            triplets[(i * n + j) * n + k] = value;
        }
    }

    pub fn n_points(&self) -> usize {
        self.n
    }

    pub fn well_variable(&self) -> f64 {
        self.well_variable
    }

    pub fn bond(&self, i: usize, j: usize) -> BondValue {
        self.bonds[i * self.n + j]
    }

    /// Scalar Mayer value of a pair.
    pub fn f(&self, i: usize, j: usize) -> f64 {
        self.bond(i, j).at(self.well_variable)
    }

    pub fn e(&self, i: usize, j: usize) -> f64 {
        1.0 + self.f(i, j)
    }

    pub fn beta_u(&self, i: usize, j: usize) -> f64 {
        self.beta_u[i * self.n + j]
    }

    /// Three-body Mayer value; 0 when the system has no triplet function.
    pub fn triplet(&self, i: usize, j: usize, k: usize) -> f64 {
        let mut idx = [i, j, k];
        idx.sort_unstable();
        let n = self.n;
        self.triplets
            .as_ref()
            .map_or(0.0, |t| t[(idx[0] * n + idx[1]) * n + idx[2]])
    }

    pub fn is_bonded(&self, i: usize, j: usize) -> bool {
        !self.bond(i, j).is_zero()
    }

    pub fn edge_class(&self, i: usize, j: usize) -> EdgeClass {
        EdgeClass::of(&self.bond(i, j))
    }

    /// Adjacency bit masks of the non-zero bond graph.
    pub fn adjacency(&self) -> Vec<u32> {
        let mut adj = vec![0u32; self.n];
        for i in 0..self.n {
            for j in 0..self.n {
                if i != j && self.is_bonded(i, j) {
                    adj[i] |= 1 << j;
                }
            }
        }
        adj
    }

    /// Number of core and well pairs.
    pub fn edge_counts(&self) -> [u32; 2] {
        let mut counts = [0u32; 2];
        for i in 0..self.n {
            for j in (i + 1)..self.n {
                match self.edge_class(i, j) {
                    EdgeClass::Core => counts[0] += 1,
                    EdgeClass::Well => counts[1] += 1,
                    EdgeClass::Unbonded => {}
                }
            }
        }
        counts
    }
}
