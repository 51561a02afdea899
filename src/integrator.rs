//! Equilibration and production driver for one worker.
//!
//! A macro-step is a block of micro-steps, each applying one trial move to
//! a box chosen at random with probability f₀ for box 0. Between blocks the
//! integrator retunes step sizes and α (equilibration only), adapts f₀ and
//! optionally reweights the binned accumulators (production only).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::accumulator::{BinnedAccumulator, BlockTally, RatioEstimate};
use crate::error::{Result, VirialError};
use crate::moves::AcceptanceBand;
use crate::overlap::{AlphaGrid, OverlapBridge};
use crate::sampler::DualBoxSampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SamplingMode {
    /// Reference and target boxes bridged by the overlap function
    #[serde(rename = "overlap")]
    #[default]
    Overlap,
    /// Reference box only, target measured on its configurations
    #[serde(rename = "direct")]
    Direct,
}

impl SamplingMode {
    pub fn n_boxes(&self) -> usize {
        match self {
            SamplingMode::Overlap => 2,
            SamplingMode::Direct => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Equilibrating,
    Production,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSettings {
    /// Micro-steps per macro-step
    pub block_size: u64,
    /// Macro-steps spent equilibrating at most
    pub equilibration_steps: u64,
    /// Production macro-steps
    pub production_steps: u64,
    /// Macro-steps between α retunes and stability checks
    pub alpha_interval: u64,
    pub alpha_grid: AlphaGrid,
    /// Leave equilibration early once α and every step size move by less
    /// than this (relative) between checks
    pub stabilise_tolerance: Option<f64>,
    pub band: AcceptanceBand,
    /// Production macro-steps between reweighting rounds; 0 disables
    pub reweight_interval: u64,
    /// Cost of one measurement relative to generating one configuration
    pub cost_ratio: f64,
    /// Adapt the box-0 step fraction during production
    pub tune_fraction: bool,
    /// Measure per-box cost in wall time instead of counting steps
    pub timed_cost: bool,
    pub initial_fraction: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        IntegratorSettings {
            block_size: 1000,
            equilibration_steps: 100,
            production_steps: 1000,
            alpha_interval: 10,
            alpha_grid: AlphaGrid::default(),
            stabilise_tolerance: None,
            band: AcceptanceBand::default(),
            reweight_interval: 0,
            cost_ratio: 1.0,
            tune_fraction: true,
            timed_cost: false,
            initial_fraction: 0.5,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        let fail = |m: String| Err(VirialError::InvalidParameter(m));
        if self.block_size == 0 {
            return fail("block_size must be at least 1".into());
        }
        if self.alpha_interval == 0 {
            return fail("alpha_interval must be at least 1".into());
        }
        if !(self.initial_fraction > 0.0 && self.initial_fraction < 1.0) {
            return fail(format!(
                "initial box-0 fraction must lie in (0, 1), got {}",
                self.initial_fraction
            ));
        }
        if !(self.cost_ratio > 0.0 && self.cost_ratio.is_finite()) {
            return fail(format!("cost ratio must be positive, got {}", self.cost_ratio));
        }
        if self.band.low >= self.band.high || self.band.interval == 0 {
            return fail(format!(
                "acceptance band [{}, {}] every {} trials is empty",
                self.band.low, self.band.high, self.band.interval
            ));
        }
        if self.alpha_grid.points < 2 || !(self.alpha_grid.span > 0.0) {
            return fail("alpha grid needs at least two points and a positive span".into());
        }
        Ok(())
    }
}

/// Final acceptance and step size of one move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveReport {
    pub box_index: usize,
    pub name: String,
    pub acceptance: f64,
    pub step: Option<f64>,
}

/// What one worker reports after its loop ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub id: usize,
    pub macro_steps: u64,
    pub production_steps: u64,
    pub alpha: f64,
    pub fraction: f64,
    /// Ratios from this worker's samples alone
    pub ratios: Vec<RatioEstimate>,
    pub moves: Vec<MoveReport>,
    pub resets: u64,
    pub sanitized: u64,
    pub cancelled: bool,
}

pub struct OverlapIntegrator {
    id: usize,
    sampler: DualBoxSampler,
    bridge: OverlapBridge,
    mode: SamplingMode,
    settings: IntegratorSettings,
    /// One per box in overlap mode, a single one in direct mode
    accumulators: Vec<Arc<BinnedAccumulator>>,
    /// Samples of the current production block, per accumulator
    blocks: Vec<BlockTally>,
    reweighter: bool,
    phase: Phase,
    macro_steps: u64,
    production_done: u64,
    fraction: f64,
    box_steps: [u64; 2],
    box_cost: [f64; 2],
    last_steps: Vec<Option<f64>>,
}

impl OverlapIntegrator {
    /// `reweighter` marks the worker that recomputes bin weights.
    pub fn new(
        id: usize,
        sampler: DualBoxSampler,
        mode: SamplingMode,
        settings: IntegratorSettings,
        accumulators: Vec<Arc<BinnedAccumulator>>,
        reweighter: bool,
    ) -> Result<Self> {
        settings.validate()?;
        if sampler.n_boxes() != mode.n_boxes() || accumulators.len() != mode.n_boxes() {
            return Err(VirialError::InvalidParameter(format!(
                "{:?} sampling needs {} boxes and accumulators, got {} and {}",
                mode,
                mode.n_boxes(),
                sampler.n_boxes(),
                accumulators.len()
            )));
        }
        let n_orders = sampler.systems().n_orders();
        let expected: &[usize] = match mode {
            SamplingMode::Overlap => &[1, n_orders],
            SamplingMode::Direct => &[n_orders],
        };
        for (b, (acc, &k)) in accumulators.iter().zip(expected).enumerate() {
            if acc.n_orders() != k {
                return Err(VirialError::InvalidParameter(format!(
                    "accumulator of box {b} holds {} orders, expected {k}",
                    acc.n_orders()
                )));
            }
        }
        let bridge = OverlapBridge::new(sampler.alpha(), settings.alpha_grid, n_orders);
        let fraction = match mode {
            SamplingMode::Overlap => settings.initial_fraction,
            SamplingMode::Direct => 1.0,
        };
        let blocks = accumulators.iter().map(|a| BlockTally::new(a.n_orders())).collect();
        let mut integrator = OverlapIntegrator {
            id,
            sampler,
            bridge,
            mode,
            settings,
            accumulators,
            blocks,
            reweighter,
            phase: Phase::Equilibrating,
            macro_steps: 0,
            production_done: 0,
            fraction,
            box_steps: [0; 2],
            box_cost: [0.0; 2],
            last_steps: Vec::new(),
        };
        integrator.last_steps = integrator.step_sizes();
        if settings.equilibration_steps == 0 {
            integrator.begin_production();
        }
        Ok(integrator)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn alpha(&self) -> f64 {
        self.bridge.alpha()
    }

    /// Probability of stepping box 0.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn macro_steps(&self) -> u64 {
        self.macro_steps
    }

    pub fn sampler(&self) -> &DualBoxSampler {
        &self.sampler
    }

    pub fn bridge(&self) -> &OverlapBridge {
        &self.bridge
    }

    fn step_sizes(&self) -> Vec<Option<f64>> {
        self.sampler
            .boxes()
            .iter()
            .flat_map(|b| b.moves().iter().map(|m| m.step_size()))
            .collect()
    }

    fn choose_box(&mut self) -> usize {
        match self.mode {
            SamplingMode::Direct => 0,
            SamplingMode::Overlap => {
                if self.sampler.rng().gen::<f64>() < self.fraction {
                    0
                } else {
                    1
                }
            }
        }
    }

    fn micro_step(&mut self) {
        let b = self.choose_box();
        let start = self.settings.timed_cost.then(Instant::now);
        self.sampler.step_box(b);
        self.box_steps[b] += 1;
        self.box_cost[b] += start.map_or(1.0, |t| t.elapsed().as_secs_f64());
        match self.phase {
            Phase::Equilibrating => self.observe(b),
            Phase::Production => self.record(b),
            Phase::Done => {}
        }
    }

    /// Feed the α grid; equilibration samples are never recorded.
    fn observe(&mut self, b: usize) {
        if self.mode != SamplingMode::Overlap {
            return;
        }
        let sample = self.sampler.sample(b);
        match sample.target {
            Some(target) => self.bridge.accumulate(b, sample.reference, target, sample.weight),
            None => {
                let target = self.sampler.target_value(b);
                self.bridge.accumulate(b, sample.reference, &target, sample.weight);
            }
        }
    }

    /// Record one production sample. The target is evaluated only when the
    /// bin's weight selects the sample for measurement.
    fn record(&mut self, b: usize) {
        let u: f64 = self.sampler.rng().gen();
        let sampler = &self.sampler;
        let bridge = &self.bridge;
        let mode = self.mode;
        let sample = sampler.sample(b);
        let measured = self.accumulators[b].record_sample(&sample.key, u, || {
            let fallback;
            let target = match sample.target {
                Some(t) => t,
                None => {
                    fallback = sampler.target_value(b);
                    &fallback
                }
            };
            match mode {
                SamplingMode::Overlap => bridge.measurement(b, sample.reference, target, sample.weight),
                SamplingMode::Direct => OverlapBridge::direct_measurement(sample.reference, target, sample.weight),
            }
        });
        self.blocks[b].observe(measured.as_ref());
        if mode == SamplingMode::Overlap {
            self.bridge.record_running(b, measured.as_ref());
        }
    }

    /// Run one block and the bookkeeping that follows it.
    pub fn macro_step(&mut self) -> Phase {
        if self.phase == Phase::Done {
            return self.phase;
        }
        for _ in 0..self.settings.block_size {
            self.micro_step();
        }
        self.macro_steps += 1;
        match self.phase {
            Phase::Equilibrating => self.end_equilibration_block(),
            Phase::Production => self.end_production_block(),
            Phase::Done => {}
        }
        self.phase
    }

    fn end_equilibration_block(&mut self) {
        self.sampler.tune_moves(&self.settings.band);
        let due = self.macro_steps % self.settings.alpha_interval == 0;
        if due && self.mode == SamplingMode::Overlap {
            if let Some(alpha) = self.bridge.retune() {
                self.sampler.set_alpha(alpha);
            }
        }
        let stable = due && self.check_stable();
        if stable {
            info!("worker {} stabilised after {} macro-steps", self.id, self.macro_steps);
        }
        if stable || self.macro_steps >= self.settings.equilibration_steps {
            self.begin_production();
        }
    }

    fn check_stable(&mut self) -> bool {
        let steps = self.step_sizes();
        let previous = std::mem::replace(&mut self.last_steps, steps);
        let Some(tol) = self.settings.stabilise_tolerance else {
            return false;
        };
        let steps_stable = previous.len() == self.last_steps.len()
            && previous.iter().zip(&self.last_steps).all(|(a, b)| match (a, b) {
                (Some(a), Some(b)) => ((b - a) / a).abs() < tol,
                (None, None) => true,
                _ => false,
            });
        let alpha_stable = self.mode == SamplingMode::Direct || self.bridge.is_stable(tol);
        steps_stable && alpha_stable
    }

    fn begin_production(&mut self) {
        self.bridge.freeze();
        self.phase = if self.settings.production_steps == 0 {
            Phase::Done
        } else {
            Phase::Production
        };
        info!(
            "worker {} starts production after {} macro-steps, alpha = {:.6}",
            self.id, self.macro_steps, self.bridge.alpha()
        );
        for (b, bx) in self.sampler.boxes().iter().enumerate() {
            for mv in bx.moves().iter() {
                debug!(
                    "worker {} box {} {}: acceptance {:.3}, step {:?}",
                    self.id,
                    b,
                    mv.name(),
                    mv.stats().acceptance_rate(),
                    mv.step_size()
                );
            }
        }
    }

    fn end_production_block(&mut self) {
        self.production_done += 1;
        for (acc, tally) in self.accumulators.iter().zip(&mut self.blocks) {
            acc.commit_block(tally);
        }
        self.bridge.commit_blocks();
        if self.mode == SamplingMode::Overlap && self.settings.tune_fraction {
            self.tune_fraction();
        }
        let interval = self.settings.reweight_interval;
        if self.reweighter && interval > 0 && self.production_done % interval == 0 {
            for acc in &self.accumulators {
                acc.recompute_weights(self.settings.cost_ratio);
            }
            debug!(
                "worker {} reweighted {} bins after {} production macro-steps",
                self.id,
                self.accumulators.iter().map(|a| a.len()).sum::<usize>(),
                self.production_done
            );
        }
        if self.production_done >= self.settings.production_steps {
            self.phase = Phase::Done;
            info!("worker {} finished {} production macro-steps", self.id, self.production_done);
        }
    }

    /// Spend steps where they reduce the combined error most per unit cost.
    fn tune_fraction(&mut self) {
        let (Some(v0), Some(v1)) = (self.bridge.relative_variance(0), self.bridge.relative_variance(1)) else {
            return;
        };
        if self.box_steps[0] == 0 || self.box_steps[1] == 0 {
            return;
        }
        let c0 = self.box_cost[0] / self.box_steps[0] as f64;
        let c1 = self.box_cost[1] / self.box_steps[1] as f64;
        let odds = (v0 * c1 / (v1 * c0)).sqrt();
        if odds.is_finite() && odds > 0.0 {
            self.fraction = (odds / (1.0 + odds)).clamp(0.01, 0.99);
        }
    }

    /// Step until done or until `cancel` is raised between macro-steps.
    pub fn run(&mut self, cancel: &AtomicBool) -> WorkerReport {
        let mut cancelled = false;
        while self.phase != Phase::Done {
            if cancel.load(Ordering::Relaxed) {
                info!("worker {} cancelled after {} macro-steps", self.id, self.macro_steps);
                cancelled = true;
                break;
            }
            self.macro_step();
        }
        let mut report = self.report();
        report.cancelled = cancelled;
        report
    }

    pub fn report(&self) -> WorkerReport {
        let ratios = match self.mode {
            SamplingMode::Overlap => self.bridge.ratio_estimate(),
            SamplingMode::Direct => self.accumulators[0].estimate().ratios,
        };
        let moves = self
            .sampler
            .boxes()
            .iter()
            .enumerate()
            .flat_map(|(b, bx)| {
                bx.moves().iter().map(move |m| MoveReport {
                    box_index: b,
                    name: m.name().to_string(),
                    acceptance: m.stats().acceptance_rate(),
                    step: m.step_size(),
                })
            })
            .collect();
        WorkerReport {
            id: self.id,
            macro_steps: self.macro_steps,
            production_steps: self.production_done,
            alpha: self.bridge.alpha(),
            fraction: self.fraction,
            ratios,
            moves,
            resets: self.sampler.boxes().iter().map(|b| b.resets).sum(),
            sanitized: self.sampler.boxes().iter().map(|b| b.sanitized).sum(),
            cancelled: false,
        }
    }
}
