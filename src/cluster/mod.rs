//! Cluster diagram evaluation.
//!
//! A [`Cluster`] turns the bond matrix of one configuration into per-order
//! cluster values. Evaluation always screens first: when the bonded graph
//! cannot support any diagram the value is exactly zero and the expensive
//! sum is skipped.

pub mod reference;
pub mod rigid;
pub mod wheatley;


use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bond::{BondFunction, BondMatrix, TripletFunction};
use crate::error::{Result, VirialError};
use crate::geometry::Configuration;
use rigid::RigidCluster;
use wheatley::{is_biconnected, is_connected, MAX_POINTS};

/// Cluster value of one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterValue {
    /// Full value at the run's well variable
    pub value: f64,
    /// Per-order coefficients; a single entry equal to `value` unless the
    /// bonds are split
    pub orders: Vec<f64>,
    /// False when screening proved the value is zero
    pub nonzero: bool,
    /// Set when a non-finite result was replaced by zero
    pub sanitized: bool,
}

impl ClusterValue {
    pub fn zero(n_orders: usize) -> Self {
        ClusterValue {
            value: 0.0,
            orders: vec![0.0; n_orders.max(1)],
            nonzero: false,
            sanitized: false,
        }
    }

    pub fn scalar(value: f64) -> Self {
        ClusterValue {
            value,
            orders: vec![value],
            nonzero: true,
            sanitized: false,
        }
    }

    pub fn n_orders(&self) -> usize {
        self.orders.len()
    }

    fn sanitize(mut self) -> Self {
        if self.value.is_finite() && self.orders.iter().all(|v| v.is_finite()) {
            return self;
        }
        debug!("non-finite cluster value {} replaced by zero", self.value);
        self.value = 0.0;
        self.orders.fill(0.0);
        self.nonzero = false;
        self.sanitized = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cluster {
    /// Sum over all biconnected Mayer graphs, computed recursively
    Flexible { n: usize, orders: usize },
    /// Explicit diagram terms
    Rigid(RigidCluster),
    /// Hard-sphere tree reference
    Tree { n: usize },
    /// Hard-sphere chain reference
    Chain { n: usize },
    /// Explicit difference of two full evaluations
    Difference(Box<Cluster>, Box<Cluster>),
}

fn check_points(n: usize, what: &'static str) -> Result<()> {
    if (2..=MAX_POINTS).contains(&n) {
        Ok(())
    } else {
        Err(VirialError::UnsupportedPoints {
            n,
            what,
            supported: "2..=16",
        })
    }
}

fn full_mask(n: usize) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

impl Cluster {
    pub fn flexible(n: usize, bond: &BondFunction) -> Result<Self> {
        check_points(n, "biconnected sum")?;
        Ok(Cluster::Flexible {
            n,
            orders: bond.polynomial_orders(n),
        })
    }

    pub fn tree(n: usize) -> Result<Self> {
        check_points(n, "tree reference")?;
        Ok(Cluster::Tree { n })
    }

    pub fn chain(n: usize) -> Result<Self> {
        check_points(n, "chain reference")?;
        Ok(Cluster::Chain { n })
    }

    pub fn difference(a: Cluster, b: Cluster) -> Result<Self> {
        if a.n_points() != b.n_points() || a.n_orders() != b.n_orders() {
            return Err(VirialError::InvalidParameter(format!(
                "cannot subtract clusters of {} points / {} orders and {} points / {} orders",
                a.n_points(),
                a.n_orders(),
                b.n_points(),
                b.n_orders()
            )));
        }
        Ok(Cluster::Difference(Box::new(a), Box::new(b)))
    }

    pub fn n_points(&self) -> usize {
        match self {
            Cluster::Flexible { n, .. } | Cluster::Tree { n } | Cluster::Chain { n } => *n,
            Cluster::Rigid(r) => r.n_points(),
            Cluster::Difference(a, _) => a.n_points(),
        }
    }

    pub fn n_orders(&self) -> usize {
        match self {
            Cluster::Flexible { orders, .. } => *orders,
            Cluster::Difference(a, _) => a.n_orders(),
            _ => 1,
        }
    }

    /// Cheap non-zero pre-check.
    pub fn screen(&self, bonds: &BondMatrix) -> bool {
        match self {
            Cluster::Flexible { .. } => is_biconnected(&bonds.adjacency()),
            Cluster::Tree { n } | Cluster::Chain { n } => is_connected(&bonds.adjacency(), full_mask(*n)),
            Cluster::Rigid(r) => r.screen(bonds),
            Cluster::Difference(a, b) => a.screen(bonds) || b.screen(bonds),
        }
    }

    pub fn evaluate(&self, bonds: &BondMatrix) -> ClusterValue {
        debug_assert_eq!(bonds.n_points(), self.n_points());
        let value = match self {
            Cluster::Difference(a, b) => {
                let va = a.evaluate(bonds);
                let vb = b.evaluate(bonds);
                let orders = va.orders.iter().zip(&vb.orders).map(|(x, y)| x - y).collect();
                ClusterValue {
                    value: va.value - vb.value,
                    orders,
                    nonzero: va.nonzero || vb.nonzero,
                    sanitized: va.sanitized || vb.sanitized,
                }
            }
            _ if !self.screen(bonds) => return ClusterValue::zero(self.n_orders()),
            Cluster::Flexible { orders, .. } if *orders > 1 => {
                let coefficients = wheatley::biconnected_polynomial(bonds, *orders);
                let x = bonds.well_variable();
                let total = coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c);
                ClusterValue {
                    value: total,
                    orders: coefficients,
                    nonzero: true,
                    sanitized: false,
                }
            }
            Cluster::Flexible { .. } => ClusterValue::scalar(wheatley::biconnected_sum(bonds)),
            Cluster::Rigid(r) => ClusterValue::scalar(r.evaluate(bonds)),
            Cluster::Tree { .. } => ClusterValue::scalar(reference::tree_value(bonds)),
            Cluster::Chain { .. } => ClusterValue::scalar(reference::chain_value(bonds)),
        };
        value.sanitize()
    }
}

/// Target cluster selection as written in a run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClusterKind {
    /// Recursive biconnected sum
    #[serde(rename = "flexible")]
    Flexible,
    /// Every biconnected graph enumerated explicitly
    #[serde(rename = "biconnected")]
    Biconnected,
    /// Ring diagram with all distinct labellings
    #[serde(rename = "ring")]
    Ring,
    /// Three-body correction to B3
    #[serde(rename = "nonadditive_b3")]
    NonadditiveB3,
    #[serde(rename = "difference")]
    Difference {
        plus: Box<ClusterKind>,
        minus: Box<ClusterKind>,
    },
}

impl ClusterKind {
    pub fn build(&self, n: usize, bond: &BondFunction) -> Result<Cluster> {
        match self {
            ClusterKind::Flexible => Cluster::flexible(n, bond),
            ClusterKind::Biconnected => RigidCluster::biconnected(n).map(Cluster::Rigid),
            ClusterKind::Ring => RigidCluster::ring(n).map(Cluster::Rigid),
            ClusterKind::NonadditiveB3 if n == 3 => RigidCluster::nonadditive_b3().map(Cluster::Rigid),
            ClusterKind::NonadditiveB3 => Err(VirialError::UnsupportedPoints {
                n,
                what: "non-additive B3",
                supported: "3",
            }),
            ClusterKind::Difference { plus, minus } => {
                Cluster::difference(plus.build(n, bond)?, minus.build(n, bond)?)
            }
        }
    }

    /// Whether the diagrams carry triplet factors.
    pub fn needs_triplets(&self) -> bool {
        match self {
            ClusterKind::NonadditiveB3 => true,
            ClusterKind::Difference { plus, minus } => plus.needs_triplets() || minus.needs_triplets(),
            _ => false,
        }
    }
}

/// Everything needed to go from positions to a cluster value.
#[derive(Debug, Clone)]
pub struct ClusterSystem {
    pub bond: BondFunction,
    pub triplet: Option<TripletFunction>,
    pub cluster: Cluster,
    pub beta: f64,
}

impl ClusterSystem {
    pub fn new(bond: BondFunction, cluster: Cluster, beta: f64) -> Self {
        ClusterSystem {
            bond,
            triplet: None,
            cluster,
            beta,
        }
    }

    pub fn with_triplet(mut self, triplet: TripletFunction) -> Self {
        self.triplet = Some(triplet);
        self
    }

    pub fn n_points(&self) -> usize {
        self.cluster.n_points()
    }

    pub fn n_orders(&self) -> usize {
        self.cluster.n_orders()
    }

    pub fn bond_matrix(&self, config: &Configuration) -> BondMatrix {
        BondMatrix::compute(&self.bond, self.triplet.as_ref(), self.beta, config)
    }

    pub fn update_bonds(&self, bonds: &mut BondMatrix, config: &Configuration, moved: &[usize]) {
        bonds.update(&self.bond, self.triplet.as_ref(), self.beta, config, moved);
    }

    pub fn evaluate(&self, bonds: &BondMatrix) -> ClusterValue {
        self.cluster.evaluate(bonds)
    }
}
