//! Whole-configuration and segment regrowth moves.
//!
//! Chain and tree regrowth draw a fresh configuration from the hard-sphere
//! chain or tree reference distribution and act as independence proposals.
//! Ring regrowth rebuilds a contiguous segment with a Gaussian bridge between
//! two fixed neighbours and picks among several candidates per point with
//! probability proportional to a local weight.

use std::f64::consts::PI;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, UnitBall};

use super::{MoveContext, MoveDelta, MoveStats, TrialMove};
use crate::bond::{BondFunction, BondMatrix};
use crate::cluster::reference::{hamiltonian_path_sum, spanning_tree_sum};
use crate::error::{Result, VirialError};
use crate::geometry::Configuration;

fn ball_step(sigma: f64, rng: &mut StdRng) -> Vector3<f64> {
    let v: [f64; 3] = UnitBall.sample(rng);
    Vector3::from(v) * sigma
}

fn overlap_bonds(sigma: f64, config: &Configuration) -> BondMatrix {
    BondMatrix::compute(&BondFunction::HardSphere { sigma }, None, 1.0, config)
}

/// Labelled tree encoded by a Prüfer sequence over `n` points.
pub(crate) fn prufer_edges(seq: &[usize], n: usize) -> Vec<(usize, usize)> {
    let mut degree = vec![1usize; n];
    for &s in seq {
        degree[s] += 1;
    }
    let mut edges = Vec::with_capacity(n.saturating_sub(1));
    for &s in seq {
        if let Some(leaf) = (0..n).find(|&v| degree[v] == 1) {
            edges.push((leaf, s));
            degree[leaf] -= 1;
            degree[s] -= 1;
        }
    }
    let rest: Vec<usize> = (0..n).filter(|&v| degree[v] == 1).collect();
    if let [u, v] = rest.as_slice() {
        edges.push((*u, *v));
    }
    edges
}

/// Independent regrowth along a random Hamiltonian chain.
#[derive(Debug, Clone)]
pub struct ChainRegrow {
    sigma: f64,
    moved: Vec<usize>,
    delta: MoveDelta,
    stats: MoveStats,
}

impl ChainRegrow {
    pub fn new(sigma: f64) -> Self {
        ChainRegrow {
            sigma,
            moved: Vec::new(),
            delta: MoveDelta::default(),
            stats: MoveStats::new(),
        }
    }

    fn log_paths(&self, config: &Configuration) -> f64 {
        hamiltonian_path_sum(&overlap_bonds(self.sigma, config)).ln()
    }
}

impl TrialMove for ChainRegrow {
    fn name(&self) -> &'static str {
        "chain_regrow"
    }

    fn propose(&mut self, config: &mut Configuration, _ctx: &MoveContext, rng: &mut StdRng) -> f64 {
        let n = config.len();
        self.moved = (1..n).collect();
        self.delta.save(config, &self.moved);
        let log_old = self.log_paths(config);

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let mut rel = vec![Vector3::zeros(); n];
        for w in 1..n {
            rel[order[w]] = rel[order[w - 1]] + ball_step(self.sigma, rng);
        }
        let shift = config.position(0) - rel[0];
        for i in 1..n {
            config.set_position(i, rel[i] + shift);
        }

        log_old - self.log_paths(config)
    }

    fn moved(&self) -> &[usize] {
        &self.moved
    }

    fn accept(&mut self) {
        self.stats.record(true);
        self.delta.clear();
    }

    fn reject(&mut self, config: &mut Configuration) {
        self.stats.record(false);
        self.delta.restore(config);
    }

    fn stats(&self) -> &MoveStats {
        &self.stats
    }
}

/// Independent regrowth along a uniformly random labelled tree rooted at the
/// anchor.
#[derive(Debug, Clone)]
pub struct TreeRegrow {
    sigma: f64,
    moved: Vec<usize>,
    delta: MoveDelta,
    stats: MoveStats,
}

impl TreeRegrow {
    pub fn new(sigma: f64) -> Self {
        TreeRegrow {
            sigma,
            moved: Vec::new(),
            delta: MoveDelta::default(),
            stats: MoveStats::new(),
        }
    }

    fn log_trees(&self, config: &Configuration) -> f64 {
        spanning_tree_sum(&overlap_bonds(self.sigma, config)).ln()
    }
}

impl TrialMove for TreeRegrow {
    fn name(&self) -> &'static str {
        "tree_regrow"
    }

    fn propose(&mut self, config: &mut Configuration, _ctx: &MoveContext, rng: &mut StdRng) -> f64 {
        let n = config.len();
        self.moved = (1..n).collect();
        self.delta.save(config, &self.moved);
        let log_old = self.log_trees(config);

        let seq: Vec<usize> = (0..n.saturating_sub(2)).map(|_| rng.gen_range(0..n)).collect();
        let mut neighbours = vec![Vec::new(); n];
        for (u, v) in prufer_edges(&seq, n) {
            neighbours[u].push(v);
            neighbours[v].push(u);
        }
        // breadth-first from the anchor
        let mut placed = vec![false; n];
        placed[0] = true;
        let mut queue = std::collections::VecDeque::from([0usize]);
        while let Some(parent) = queue.pop_front() {
            let origin = config.position(parent);
            for &child in &neighbours[parent] {
                if !placed[child] {
                    placed[child] = true;
                    config.set_position(child, origin + ball_step(self.sigma, rng));
                    queue.push_back(child);
                }
            }
        }

        log_old - self.log_trees(config)
    }

    fn moved(&self) -> &[usize] {
        &self.moved
    }

    fn accept(&mut self) {
        self.stats.record(true);
        self.delta.clear();
    }

    fn reject(&mut self, config: &mut Configuration) {
        self.stats.record(false);
        self.delta.restore(config);
    }

    fn stats(&self) -> &MoveStats {
        &self.stats
    }
}

/// Configurational-bias regrowth of a ring segment.
#[derive(Debug, Clone)]
pub struct RingRegrow {
    width: f64,
    max_segment: usize,
    candidates: usize,
    moved: Vec<usize>,
    delta: MoveDelta,
    stats: MoveStats,
    trial: Vec<(Vector3<f64>, f64)>,
}

fn log_gaussian(x: &Vector3<f64>, mean: &Vector3<f64>, sd: f64) -> f64 {
    let z2 = (x - mean).norm_squared() / (sd * sd);
    -0.5 * z2 - 3.0 * (sd * (2.0 * PI).sqrt()).ln()
}

fn gaussian(mean: &Vector3<f64>, sd: f64, rng: &mut StdRng) -> Vector3<f64> {
    let z = Vector3::new(
        rng.sample::<f64, _>(StandardNormal),
        rng.sample::<f64, _>(StandardNormal),
        rng.sample::<f64, _>(StandardNormal),
    );
    mean + z * sd
}

impl RingRegrow {
    pub fn new(n: usize, width: f64, max_segment: usize, candidates: usize) -> Result<Self> {
        if candidates == 0 {
            return Err(VirialError::InvalidParameter(
                "ring regrowth needs at least one candidate".into(),
            ));
        }
        if max_segment == 0 {
            return Err(VirialError::InvalidParameter(
                "ring regrowth segment length must be at least 1".into(),
            ));
        }
        Ok(RingRegrow {
            width,
            max_segment: max_segment.min(n.saturating_sub(1)).max(1),
            candidates,
            moved: Vec::new(),
            delta: MoveDelta::default(),
            stats: MoveStats::new(),
            trial: Vec::with_capacity(candidates),
        })
    }

    /// 1 + Σ|f| against every point outside the unplaced part `first..end`.
    fn local_weight(
        config: &Configuration,
        ctx: &MoveContext,
        p: &Vector3<f64>,
        first: usize,
        end: usize,
    ) -> f64 {
        let mut b = 1.0;
        for m in (0..config.len()).filter(|&m| m < first || m >= end) {
            b += ctx.bond.value(config.distance2_to(p, m), ctx.beta).abs();
        }
        b
    }

    /// Bridge statistics for the point after `prev` with `links` links left
    /// to `end`.
    fn bridge(&self, prev: &Vector3<f64>, end: &Vector3<f64>, links: usize) -> (Vector3<f64>, f64) {
        let l = links as f64;
        let mean = prev + (end - prev) / l;
        let sd = self.width * ((l - 1.0) / l).sqrt();
        (mean, sd)
    }
}

impl TrialMove for RingRegrow {
    fn name(&self) -> &'static str {
        "ring_regrow"
    }

    fn propose(&mut self, config: &mut Configuration, ctx: &MoveContext, rng: &mut StdRng) -> f64 {
        let n = config.len();
        let len = rng.gen_range(1..=self.max_segment.min(n - 1));
        let first = rng.gen_range(1..=n - len);
        let stop = first + len;
        let start_anchor = config.position(first - 1);
        let end_anchor = config.position(stop % n);
        self.moved = (first..stop).collect();
        self.delta.save(config, &self.moved);

        // reverse move: the old segment among k - 1 fresh candidates
        let mut log_old = 0.0;
        let mut prev = start_anchor;
        for (step, j) in (first..stop).enumerate() {
            let (mean, sd) = self.bridge(&prev, &end_anchor, len + 1 - step);
            let old = config.position(j);
            let b_old = Self::local_weight(config, ctx, &old, j, stop);
            let mut total = b_old;
            for _ in 1..self.candidates {
                let c = gaussian(&mean, sd, rng);
                total += Self::local_weight(config, ctx, &c, j, stop);
            }
            log_old += log_gaussian(&old, &mean, sd) + b_old.ln() - total.ln();
            prev = old;
        }

        let mut log_new = 0.0;
        let mut prev = start_anchor;
        for (step, j) in (first..stop).enumerate() {
            let (mean, sd) = self.bridge(&prev, &end_anchor, len + 1 - step);
            self.trial.clear();
            let mut total = 0.0;
            for _ in 0..self.candidates {
                let c = gaussian(&mean, sd, rng);
                let b = Self::local_weight(config, ctx, &c, j, stop);
                total += b;
                self.trial.push((c, b));
            }
            let mut pick = rng.gen::<f64>() * total;
            let mut chosen = self.trial[self.trial.len() - 1];
            for &(c, b) in &self.trial {
                if pick < b {
                    chosen = (c, b);
                    break;
                }
                pick -= b;
            }
            log_new += log_gaussian(&chosen.0, &mean, sd) + chosen.1.ln() - total.ln();
            config.set_position(j, chosen.0);
            prev = chosen.0;
        }

        log_old - log_new
    }

    fn moved(&self) -> &[usize] {
        &self.moved
    }

    fn accept(&mut self) {
        self.stats.record(true);
        self.delta.clear();
    }

    fn reject(&mut self, config: &mut Configuration) {
        self.stats.record(false);
        self.delta.restore(config);
    }

    fn stats(&self) -> &MoveStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::reference::{chain_value, tree_value};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn ctx_bond() -> BondFunction {
        BondFunction::HardSphere { sigma: 1.0 }
    }

    #[test]
    fn test_prufer_decodes_spanning_trees() {
        assert_eq!(prufer_edges(&[], 2), vec![(0, 1)]);
        let edges = prufer_edges(&[3, 3, 3], 5);
        assert_eq!(edges.len(), 4);
        assert!(edges.iter().all(|&(u, v)| u == 3 || v == 3));
    }

    #[test]
    fn test_chain_regrow_is_exact_independence_proposal() {
        let bond = ctx_bond();
        let ctx = MoveContext { bond: &bond, beta: 1.0 };
        let mut rng = StdRng::seed_from_u64(9);
        let mut cfg = Configuration::seed_layout(5, 0.4);
        let mut mv = ChainRegrow::new(1.0);
        for _ in 0..50 {
            let old = chain_value(&overlap_bonds(1.0, &cfg));
            let ln_q = mv.propose(&mut cfg, &ctx, &mut rng);
            let new = chain_value(&overlap_bonds(1.0, &cfg));
            assert!(new > 0.0);
            // sampling the chain weight itself accepts every proposal
            assert_abs_diff_eq!((new / old).ln() + ln_q, 0.0, epsilon = 1e-9);
            mv.accept();
            assert_eq!(cfg.position(0), Vector3::zeros());
        }
    }

    #[test]
    fn test_tree_regrow_is_exact_independence_proposal() {
        let bond = ctx_bond();
        let ctx = MoveContext { bond: &bond, beta: 1.0 };
        let mut rng = StdRng::seed_from_u64(10);
        let mut cfg = Configuration::seed_layout(6, 0.4);
        let mut mv = TreeRegrow::new(1.0);
        for _ in 0..50 {
            let old = tree_value(&overlap_bonds(1.0, &cfg));
            let ln_q = mv.propose(&mut cfg, &ctx, &mut rng);
            let new = tree_value(&overlap_bonds(1.0, &cfg));
            assert!(new > 0.0);
            assert_abs_diff_eq!((new / old).ln() + ln_q, 0.0, epsilon = 1e-8);
            mv.accept();
        }
    }

    #[test]
    fn test_ring_regrow_keeps_segment_near_anchors() {
        let bond = ctx_bond();
        let ctx = MoveContext { bond: &bond, beta: 1.0 };
        let mut rng = StdRng::seed_from_u64(12);
        let mut cfg = Configuration::seed_layout(6, 0.5);
        let mut mv = RingRegrow::new(6, 0.3, 3, 4).unwrap();
        for _ in 0..30 {
            let ln_q = mv.propose(&mut cfg, &ctx, &mut rng);
            assert!(ln_q.is_finite());
            let moved = mv.moved().to_vec();
            assert!(!moved.is_empty() && moved.len() <= 3);
            assert!(moved.windows(2).all(|w| w[1] == w[0] + 1));
            mv.reject(&mut cfg);
        }
        assert!(RingRegrow::new(6, 0.3, 3, 0).is_err());
    }
}
