//! Trial moves acting on one configuration.
//!
//! Point 0 is the anchor and never moves. Every move saves the positions it
//! is about to overwrite so that `reject` restores them bit for bit.

pub mod bend;
pub mod regrow;
pub mod translate;

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bond::BondFunction;
use crate::error::{Result, VirialError};
use crate::geometry::Configuration;

pub use bend::Bend;
pub use regrow::{ChainRegrow, RingRegrow, TreeRegrow};
pub use translate::Translate;

/// Acceptance counters for one move
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveStats {
    /// Trials since the start of the run
    pub attempts: u64,
    pub accepted: u64,
    /// Trials since the last retune
    pub window_attempts: u64,
    pub window_accepted: u64,
}

impl MoveStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, accepted: bool) {
        self.attempts += 1;
        self.window_attempts += 1;
        if accepted {
            self.accepted += 1;
            self.window_accepted += 1;
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.accepted as f64 / self.attempts as f64
        }
    }

    pub fn window_rate(&self) -> f64 {
        if self.window_attempts == 0 {
            0.0
        } else {
            self.window_accepted as f64 / self.window_attempts as f64
        }
    }

    pub fn reset_window(&mut self) {
        self.window_attempts = 0;
        self.window_accepted = 0;
    }
}

/// Target acceptance band for step-size retuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceBand {
    pub low: f64,
    pub high: f64,
    /// Trials between retunes
    pub interval: u64,
}

impl Default for AcceptanceBand {
    fn default() -> Self {
        AcceptanceBand {
            low: 0.2,
            high: 0.5,
            interval: 100,
        }
    }
}

/// Adaptive step size clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSize {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl StepSize {
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        StepSize {
            value: value.clamp(min, max),
            min,
            max,
        }
    }

    /// Shrink below the band, grow above it, once per full window.
    /// Returns true when a retune happened.
    pub fn retune(&mut self, stats: &mut MoveStats, band: &AcceptanceBand) -> bool {
        if stats.window_attempts < band.interval {
            return false;
        }
        let rate = stats.window_rate();
        if rate < band.low {
            self.value *= 0.9;
        } else if rate > band.high {
            self.value *= 1.1;
        }
        self.value = self.value.clamp(self.min, self.max);
        stats.reset_window();
        true
    }
}

/// Positions overwritten by the last proposal.
#[derive(Debug, Clone, Default)]
pub struct MoveDelta {
    saved: Vec<(usize, Vector3<f64>)>,
}

impl MoveDelta {
    pub fn save(&mut self, config: &Configuration, indices: &[usize]) {
        self.saved.clear();
        self.saved
            .extend(indices.iter().map(|&i| (i, config.position(i))));
    }

    pub fn restore(&mut self, config: &mut Configuration) {
        for &(i, p) in &self.saved {
            config.set_position(i, p);
        }
        self.saved.clear();
    }

    pub fn clear(&mut self) {
        self.saved.clear();
    }
}

/// Read-only context a proposal may need.
#[derive(Debug, Clone, Copy)]
pub struct MoveContext<'a> {
    /// Bond function of the box being moved
    pub bond: &'a BondFunction,
    pub beta: f64,
}

pub trait TrialMove: Send {
    fn name(&self) -> &'static str;

    /// Modify `config` in place and return ln(q_reverse / q_forward), zero
    /// for symmetric moves.
    fn propose(&mut self, config: &mut Configuration, ctx: &MoveContext, rng: &mut StdRng) -> f64;

    /// Indices changed by the last proposal.
    fn moved(&self) -> &[usize];

    fn accept(&mut self);

    fn reject(&mut self, config: &mut Configuration);

    fn stats(&self) -> &MoveStats;

    /// Current step size, for moves that have one.
    fn step_size(&self) -> Option<f64> {
        None
    }

    /// Retune the step size against the acceptance band.
    fn tune(&mut self, _band: &AcceptanceBand) -> bool {
        false
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_candidates() -> usize {
    4
}

/// Move kinds a run can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MoveSpec {
    #[serde(rename = "translate")]
    Translate {
        step: f64,
        #[serde(default = "default_weight")]
        weight: f64,
    },
    #[serde(rename = "bend")]
    Bend {
        angle: f64,
        #[serde(default = "default_weight")]
        weight: f64,
    },
    #[serde(rename = "chain_regrow")]
    ChainRegrow {
        sigma: f64,
        #[serde(default = "default_weight")]
        weight: f64,
    },
    #[serde(rename = "tree_regrow")]
    TreeRegrow {
        sigma: f64,
        #[serde(default = "default_weight")]
        weight: f64,
    },
    #[serde(rename = "ring_regrow")]
    RingRegrow {
        width: f64,
        max_segment: usize,
        #[serde(default = "default_candidates")]
        candidates: usize,
        #[serde(default = "default_weight")]
        weight: f64,
    },
}

impl MoveSpec {
    pub fn weight(&self) -> f64 {
        match *self {
            MoveSpec::Translate { weight, .. }
            | MoveSpec::Bend { weight, .. }
            | MoveSpec::ChainRegrow { weight, .. }
            | MoveSpec::TreeRegrow { weight, .. }
            | MoveSpec::RingRegrow { weight, .. } => weight,
        }
    }

    pub fn build(&self, n: usize) -> Result<Box<dyn TrialMove>> {
        if n < 2 {
            return Err(VirialError::UnsupportedPoints {
                n,
                what: "trial moves",
                supported: "n >= 2",
            });
        }
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(v)
            } else {
                Err(VirialError::InvalidParameter(format!("{name} must be positive, got {v}")))
            }
        };
        let mv: Box<dyn TrialMove> = match *self {
            MoveSpec::Translate { step, .. } => Box::new(Translate::new(positive("translate step", step)?)),
            MoveSpec::Bend { angle, .. } => Box::new(Bend::new(positive("bend angle", angle)?)),
            MoveSpec::ChainRegrow { sigma, .. } => Box::new(ChainRegrow::new(positive("chain sigma", sigma)?)),
            MoveSpec::TreeRegrow { sigma, .. } => Box::new(TreeRegrow::new(positive("tree sigma", sigma)?)),
            MoveSpec::RingRegrow {
                width,
                max_segment,
                candidates,
                ..
            } => Box::new(RingRegrow::new(
                n,
                positive("ring width", width)?,
                max_segment,
                candidates,
            )?),
        };
        Ok(mv)
    }
}

/// Weighted collection of moves for one box.
pub struct MoveSet {
    moves: Vec<Box<dyn TrialMove>>,
    cumulative: Vec<f64>,
}

impl MoveSet {
    pub fn new(moves: Vec<(Box<dyn TrialMove>, f64)>) -> Result<Self> {
        if moves.is_empty() {
            return Err(VirialError::InvalidParameter("a box needs at least one move".into()));
        }
        let mut total = 0.0;
        let mut cumulative = Vec::with_capacity(moves.len());
        let mut list = Vec::with_capacity(moves.len());
        for (mv, weight) in moves {
            if weight.is_nan() || weight < 0.0 {
                return Err(VirialError::InvalidParameter(format!(
                    "move weight for {} must be non-negative",
                    mv.name()
                )));
            }
            total += weight;
            cumulative.push(total);
            list.push(mv);
        }
        if total <= 0.0 {
            return Err(VirialError::InvalidParameter("move weights sum to zero".into()));
        }
        for c in &mut cumulative {
            *c /= total;
        }
        Ok(MoveSet {
            moves: list,
            cumulative,
        })
    }

    pub fn from_specs(specs: &[MoveSpec], n: usize) -> Result<Self> {
        let moves = specs
            .iter()
            .map(|s| Ok((s.build(n)?, s.weight())))
            .collect::<Result<Vec<_>>>()?;
        MoveSet::new(moves)
    }

    pub fn choose(&self, rng: &mut StdRng) -> usize {
        let u: f64 = rng.gen();
        self.cumulative
            .iter()
            .position(|&c| u < c)
            .unwrap_or(self.moves.len() - 1)
    }

    pub fn get_mut(&mut self, index: usize) -> &mut dyn TrialMove {
        self.moves[index].as_mut()
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn TrialMove> {
        self.moves.iter().map(|m| &**m)
    }

    /// Retune every move; returns how many changed their step.
    pub fn tune(&mut self, band: &AcceptanceBand) -> usize {
        let mut changed = 0;
        for mv in &mut self.moves {
            if mv.tune(band) {
                changed += 1;
            }
        }
        changed
    }
}

/// Uniformly random non-anchor point.
pub(crate) fn random_free_point(n: usize, rng: &mut StdRng) -> usize {
    rng.gen_range(1..n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::{LennardJones, Potential};
    use rand::SeedableRng;

    fn all_specs() -> Vec<MoveSpec> {
        vec![
            MoveSpec::Translate { step: 0.5, weight: 1.0 },
            MoveSpec::Bend { angle: 0.8, weight: 1.0 },
            MoveSpec::ChainRegrow { sigma: 1.0, weight: 1.0 },
            MoveSpec::TreeRegrow { sigma: 1.0, weight: 1.0 },
            MoveSpec::RingRegrow {
                width: 0.8,
                max_segment: 2,
                candidates: 3,
                weight: 1.0,
            },
        ]
    }

    #[test]
    fn test_reject_restores_bitwise_for_every_move() {
        let bond = BondFunction::Mayer(Potential::LennardJones(LennardJones::new(1.0, 1.0)));
        let ctx = MoveContext { bond: &bond, beta: 1.0 };
        let mut rng = StdRng::seed_from_u64(42);
        for spec in all_specs() {
            let mut mv = spec.build(5).unwrap();
            let mut cfg = Configuration::seed_layout(5, 0.6);
            for _ in 0..50 {
                let before = cfg.clone();
                let ln_q = mv.propose(&mut cfg, &ctx, &mut rng);
                assert!(!ln_q.is_nan(), "{} produced NaN", mv.name());
                assert!(!mv.moved().contains(&0), "{} moved the anchor", mv.name());
                assert!(!cfg.bitwise_eq(&before) || mv.moved().is_empty());
                mv.reject(&mut cfg);
                assert!(cfg.bitwise_eq(&before), "{} did not restore", mv.name());
                // walk on so later trials start from fresh states
                mv.propose(&mut cfg, &ctx, &mut rng);
                mv.accept();
            }
        }
    }

    #[test]
    fn test_step_size_stays_in_bounds() {
        let band = AcceptanceBand {
            low: 0.2,
            high: 0.5,
            interval: 10,
        };
        let mut step = StepSize::new(1.0, 0.5, 2.0);
        let mut stats = MoveStats::new();
        for _ in 0..200 {
            for _ in 0..10 {
                stats.record(false);
            }
            assert!(step.retune(&mut stats, &band));
            assert!(step.value >= 0.5 && step.value <= 2.0);
        }
        assert_eq!(step.value, 0.5);
        for _ in 0..200 {
            for _ in 0..10 {
                stats.record(true);
            }
            step.retune(&mut stats, &band);
        }
        assert_eq!(step.value, 2.0);
    }

    #[test]
    fn test_retune_waits_for_full_window() {
        let band = AcceptanceBand::default();
        let mut step = StepSize::new(1.0, 0.1, 10.0);
        let mut stats = MoveStats::new();
        for _ in 0..99 {
            stats.record(false);
        }
        assert!(!step.retune(&mut stats, &band));
        assert_eq!(step.value, 1.0);
        stats.record(false);
        assert!(step.retune(&mut stats, &band));
        assert!(step.value < 1.0);
        assert_eq!(stats.window_attempts, 0);
        assert_eq!(stats.attempts, 100);
    }

    #[test]
    fn test_move_set_selection() {
        let moves = MoveSet::from_specs(
            &[
                MoveSpec::Translate { step: 0.5, weight: 3.0 },
                MoveSpec::Bend { angle: 0.5, weight: 1.0 },
            ],
            3,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut counts = [0usize; 2];
        for _ in 0..4000 {
            counts[moves.choose(&mut rng)] += 1;
        }
        assert!(counts[0] > 2700 && counts[0] < 3300);
        assert!(MoveSet::from_specs(&[], 3).is_err());
        assert!(MoveSpec::Translate { step: -1.0, weight: 1.0 }.build(3).is_err());
    }
}
