use std::collections::BTreeSet;

use itertools::Itertools;

use super::wheatley::is_biconnected;
use crate::bond::BondMatrix;
use crate::error::{Result, VirialError};

/// What a required pair contributes to a diagram term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BondSlot {
    /// Mayer f bond
    F,
    /// e = 1 + f
    E,
    /// Reduced energy βu
    U,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagramTerm {
    pub coefficient: f64,
    pub bonds: Vec<(usize, usize, BondSlot)>,
    /// Three-body f factors
    pub triplets: Vec<[usize; 3]>,
}

impl DiagramTerm {
    pub fn new(coefficient: f64) -> Self {
        DiagramTerm {
            coefficient,
            bonds: Vec::new(),
            triplets: Vec::new(),
        }
    }

    pub fn with_bond(mut self, i: usize, j: usize, slot: BondSlot) -> Self {
        self.bonds.push((i.min(j), i.max(j), slot));
        self
    }

    pub fn with_triplet(mut self, i: usize, j: usize, k: usize) -> Self {
        self.triplets.push([i, j, k]);
        self
    }

    /// Cheap check that an F bond or triplet factor is exactly zero.
    pub fn vanishes(&self, bonds: &BondMatrix) -> bool {
        self.bonds
            .iter()
            .any(|&(i, j, slot)| slot == BondSlot::F && !bonds.is_bonded(i, j))
            || self.triplets.iter().any(|t| bonds.triplet(t[0], t[1], t[2]) == 0.0)
    }

    /// Product of the required factors times the coefficient. A term whose
    /// factors include a non-finite value (an energy slot at hard overlap)
    /// contributes exactly zero.
    pub fn evaluate(&self, bonds: &BondMatrix) -> f64 {
        let mut prod = self.coefficient;
        for &(i, j, slot) in &self.bonds {
            let factor = match slot {
                BondSlot::F => bonds.f(i, j),
                BondSlot::E => bonds.e(i, j),
                BondSlot::U => bonds.beta_u(i, j),
            };
            if !factor.is_finite() {
                return 0.0;
            }
            if factor == 0.0 {
                return 0.0;
            }
            prod *= factor;
        }
        for t in &self.triplets {
            let factor = bonds.triplet(t[0], t[1], t[2]);
            if !factor.is_finite() {
                return 0.0;
            }
            prod *= factor;
        }
        prod
    }

    fn relabel(&self, perm: &[usize]) -> DiagramTerm {
        let mut bonds: Vec<_> = self
            .bonds
            .iter()
            .map(|&(i, j, slot)| {
                let (a, b) = (perm[i], perm[j]);
                (a.min(b), a.max(b), slot)
            })
            .collect();
        bonds.sort_unstable();
        let mut triplets: Vec<_> = self
            .triplets
            .iter()
            .map(|t| {
                let mut r = [perm[t[0]], perm[t[1]], perm[t[2]]];
                r.sort_unstable();
                r
            })
            .collect();
        triplets.sort_unstable();
        DiagramTerm {
            coefficient: self.coefficient,
            bonds,
            triplets,
        }
    }

    fn topology(&self) -> (Vec<(usize, usize, BondSlot)>, Vec<[usize; 3]>) {
        (self.bonds.clone(), self.triplets.clone())
    }
}

/// Explicitly enumerated diagram sum over a fixed point count.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidCluster {
    n: usize,
    terms: Vec<DiagramTerm>,
}

/// Bit-mask enumeration of labelled graphs stops here.
const MAX_ENUMERATED_POINTS: usize = 5;

impl RigidCluster {
    pub fn new(n: usize, terms: Vec<DiagramTerm>) -> Result<Self> {
        for term in &terms {
            let in_range = term.bonds.iter().all(|&(i, j, _)| i < n && j < n && i != j)
                && term.triplets.iter().all(|t| t.iter().all(|&k| k < n));
            if !in_range {
                return Err(VirialError::InvalidParameter(format!(
                    "diagram term {:?} refers to points outside 0..{}",
                    term.bonds, n
                )));
            }
        }
        Ok(RigidCluster { n, terms })
    }

    /// Every distinct labelling of a prototype term, each with the
    /// prototype's coefficient.
    pub fn from_prototype(n: usize, prototype: &DiagramTerm) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut terms = Vec::new();
        for perm in (0..n).permutations(n) {
            let term = prototype.relabel(&perm);
            let key = term.topology();
            if seen.insert(key) {
                terms.push(term);
            }
        }
        RigidCluster::new(n, terms)
    }

    /// All distinct labellings of the graph with the given F bonds.
    pub fn from_graph(n: usize, edges: &[(usize, usize)], coefficient: f64) -> Result<Self> {
        let prototype = edges
            .iter()
            .fold(DiagramTerm::new(coefficient), |t, &(i, j)| t.with_bond(i, j, BondSlot::F));
        RigidCluster::from_prototype(n, &prototype)
    }

    /// Ring diagrams of `n` points.
    pub fn ring(n: usize) -> Result<Self> {
        if n < 3 {
            return Err(VirialError::UnsupportedPoints {
                n,
                what: "ring diagram",
                supported: "n >= 3",
            });
        }
        let edges: Vec<_> = (0..n).map(|i| (i, (i + 1) % n)).collect();
        RigidCluster::from_graph(n, &edges, 1.0)
    }

    /// Every labelled biconnected graph, enumerated explicitly.
    pub fn biconnected(n: usize) -> Result<Self> {
        if !(2..=MAX_ENUMERATED_POINTS).contains(&n) {
            return Err(VirialError::UnsupportedPoints {
                n,
                what: "enumerated biconnected diagrams",
                supported: "2..=5",
            });
        }
        let pairs: Vec<(usize, usize)> = (0..n).tuple_combinations().collect();
        let mut terms = Vec::new();
        for mask in 1u32..(1 << pairs.len()) {
            let mut adj = vec![0u32; n];
            for (b, &(i, j)) in pairs.iter().enumerate() {
                if mask & (1 << b) != 0 {
                    adj[i] |= 1 << j;
                    adj[j] |= 1 << i;
                }
            }
            if is_biconnected(&adj) {
                let term = pairs
                    .iter()
                    .enumerate()
                    .filter(|(b, _)| mask & (1 << b) != 0)
                    .fold(DiagramTerm::new(1.0), |t, (_, &(i, j))| t.with_bond(i, j, BondSlot::F));
                terms.push(term);
            }
        }
        RigidCluster::new(n, terms)
    }

    /// Non-additive third-order term ∫∫ e₁₂ e₁₃ e₂₃ f₁₂₃.
    pub fn nonadditive_b3() -> Result<Self> {
        let term = DiagramTerm::new(1.0)
            .with_bond(0, 1, BondSlot::E)
            .with_bond(0, 2, BondSlot::E)
            .with_bond(1, 2, BondSlot::E)
            .with_triplet(0, 1, 2);
        RigidCluster::new(3, vec![term])
    }

    pub fn n_points(&self) -> usize {
        self.n
    }

    pub fn terms(&self) -> &[DiagramTerm] {
        &self.terms
    }

    pub fn screen(&self, bonds: &BondMatrix) -> bool {
        self.terms.iter().any(|t| !t.vanishes(bonds))
    }

    pub fn evaluate(&self, bonds: &BondMatrix) -> f64 {
        self.terms.iter().map(|t| t.evaluate(bonds)).sum()
    }
}
