//! Runs independent workers and reduces their statistics.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::accumulator::{BinKey, BinnedAccumulator, Estimate, RatioEstimate};
use crate::bond::{BondFunction, TripletFunction};
use crate::cluster::reference::{virial_prefactor, ReferenceKind};
use crate::cluster::{ClusterKind, ClusterSystem};
use crate::error::{Result, VirialError};
use crate::geometry::Configuration;
use crate::integrator::{IntegratorSettings, OverlapIntegrator, SamplingMode, WorkerReport};
use crate::io::bins::{self, RawData};
use crate::moves::{MoveSet, MoveSpec};
use crate::overlap::combine_ratios;
use crate::sampler::{BoxWeighting, DualBoxSampler, SystemPair};

/// Everything a run needs, fixed before any worker starts.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub n_points: usize,
    pub temperature: f64,
    pub bond: BondFunction,
    pub triplet: Option<TripletFunction>,
    pub cluster: ClusterKind,
    pub reference: ReferenceKind,
    pub mode: SamplingMode,
    pub weighting: BoxWeighting,
    pub reference_moves: Vec<MoveSpec>,
    pub target_moves: Vec<MoveSpec>,
    pub settings: IntegratorSettings,
    pub workers: usize,
    /// Worker i seeds its generator with `seed + i`
    pub seed: u64,
    /// Starting reference preference α
    pub alpha: f64,
    /// Radius of the seed polygon
    pub seed_radius: f64,
    pub nominal_weight: f64,
    pub min_weight: f64,
    /// One accumulator set for all workers instead of merging private ones
    pub share_accumulator: bool,
    pub restart_raw: Option<PathBuf>,
    pub restart_weights: Option<PathBuf>,
    pub raw_output: Option<PathBuf>,
    pub weights_output: Option<PathBuf>,
    pub summary_output: Option<PathBuf>,
}

impl RunParams {
    pub fn beta(&self) -> f64 {
        1.0 / self.temperature
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |m: String| Err(VirialError::InvalidParameter(m));
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return fail(format!("temperature must be positive, got {}", self.temperature));
        }
        if self.workers == 0 {
            return fail("at least one worker is required".into());
        }
        if !(self.alpha > 0.0 && self.alpha.is_finite()) {
            return fail(format!("alpha must be positive, got {}", self.alpha));
        }
        if !(self.seed_radius > 0.0 && self.seed_radius.is_finite()) {
            return fail(format!("seed radius must be positive, got {}", self.seed_radius));
        }
        if !(self.min_weight > 0.0 && self.min_weight <= self.nominal_weight && self.nominal_weight <= 1.0) {
            return fail(format!(
                "bin weights need 0 < min_weight ({}) <= nominal_weight ({}) <= 1",
                self.min_weight, self.nominal_weight
            ));
        }
        if self.cluster.needs_triplets() && self.triplet.is_none() {
            return fail("the target cluster needs a three-body potential".into());
        }
        self.settings.validate()
    }

    fn n_boxes(&self) -> usize {
        self.mode.n_boxes()
    }

    /// Orders held by the accumulator of box `b`.
    fn box_orders(&self, b: usize, n_orders: usize) -> usize {
        match (self.mode, b) {
            (SamplingMode::Overlap, 0) => 1,
            _ => n_orders,
        }
    }
}

/// One diagram order of the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEstimate {
    pub order: usize,
    /// Γ_target / Γ_reference
    pub ratio: f64,
    pub error: f64,
    /// Target cluster integral
    pub integral: f64,
    pub integral_error: f64,
    /// Virial coefficient (1 - N)/N! · integral
    pub coefficient: f64,
    pub coefficient_error: f64,
}

impl OrderEstimate {
    fn new(order: usize, r: RatioEstimate, n: usize, reference_integral: f64) -> Self {
        let integral = r.ratio * reference_integral;
        let integral_error = r.error * reference_integral.abs();
        let prefactor = virial_prefactor(n);
        OrderEstimate {
            order,
            ratio: r.ratio,
            error: r.error,
            integral,
            integral_error,
            coefficient: prefactor * integral,
            coefficient_error: prefactor.abs() * integral_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub n_points: usize,
    pub temperature: f64,
    pub mode: SamplingMode,
    pub reference: ReferenceKind,
    pub reference_integral: f64,
    pub orders: Vec<OrderEstimate>,
    /// Recorded samples per box accumulator
    pub samples: Vec<u64>,
    pub bins: Vec<usize>,
    pub workers: Vec<WorkerReport>,
    pub failed_workers: Vec<usize>,
}

/// Final statistics of a run, with the summary derived from them.
pub struct RunOutcome {
    pub summary: RunSummary,
    pub accumulators: Vec<Arc<BinnedAccumulator>>,
}

pub struct WorkerCoordinator {
    params: RunParams,
    systems: Arc<SystemPair>,
    restart: Vec<RawData>,
    weights: Vec<Vec<(BinKey, f64)>>,
}

impl WorkerCoordinator {
    /// Validates parameters and the reference integral and loads restart
    /// files. Nothing is sampled until [`WorkerCoordinator::run`].
    pub fn new(params: RunParams) -> Result<Self> {
        params.validate()?;
        let beta = params.beta();
        let cluster = params.cluster.build(params.n_points, &params.bond)?;
        let mut target = ClusterSystem::new(params.bond, cluster, beta);
        if let (Some(t), true) = (params.triplet, params.cluster.needs_triplets()) {
            target = target.with_triplet(t);
        }
        let systems = Arc::new(SystemPair::new(&params.reference, target)?);
        info!(
            "{} points at T = {}, {} target orders, reference integral {:.10e}",
            systems.n_points(),
            params.temperature,
            systems.n_orders(),
            systems.reference_integral
        );

        let n_boxes = params.n_boxes();
        let n_orders = systems.n_orders();
        let mut restart = Vec::new();
        if let Some(path) = &params.restart_raw {
            for b in 0..n_boxes {
                let p = bins::box_path(path, b, n_boxes);
                let n_values = 2 * params.box_orders(b, n_orders) + 1;
                let raw = bins::read_raw(&p, n_values)?;
                info!("restart statistics for box {} from {}: {} samples", b, p.display(), raw.total);
                restart.push(raw);
            }
        }
        let mut weights = Vec::new();
        if let Some(path) = &params.restart_weights {
            for b in 0..n_boxes {
                let p = bins::box_path(path, b, n_boxes);
                let w = bins::read_weights(&p)?;
                info!("{} bin weights for box {} from {}", w.len(), b, p.display());
                weights.push(w);
            }
        }
        Ok(WorkerCoordinator {
            params,
            systems,
            restart,
            weights,
        })
    }

    pub fn params(&self) -> &RunParams {
        &self.params
    }

    pub fn systems(&self) -> &SystemPair {
        &self.systems
    }

    fn new_accumulators(&self) -> Vec<Arc<BinnedAccumulator>> {
        let n_orders = self.systems.n_orders();
        (0..self.params.n_boxes())
            .map(|b| {
                let acc = BinnedAccumulator::new(
                    self.params.box_orders(b, n_orders),
                    self.params.nominal_weight,
                    self.params.min_weight,
                );
                if let Some(w) = self.weights.get(b) {
                    bins::load_weights_into(&acc, w);
                }
                Arc::new(acc)
            })
            .collect()
    }

    fn load_restart(&self, accumulators: &[Arc<BinnedAccumulator>]) {
        for (acc, raw) in accumulators.iter().zip(&self.restart) {
            bins::load_raw_into(acc, raw);
        }
    }

    fn build_worker(&self, id: usize, accumulators: Vec<Arc<BinnedAccumulator>>) -> Result<OverlapIntegrator> {
        let p = &self.params;
        let n = p.n_points;
        let mut moves = vec![MoveSet::from_specs(&p.reference_moves, n)?];
        if p.mode == SamplingMode::Overlap {
            moves.push(MoveSet::from_specs(&p.target_moves, n)?);
        }
        let sampler = DualBoxSampler::new(
            self.systems.clone(),
            p.weighting,
            moves,
            Configuration::seed_layout(n, p.seed_radius),
            p.alpha,
            StdRng::seed_from_u64(p.seed.wrapping_add(id as u64)),
        )?;
        let reweighter = !p.share_accumulator || id == 0;
        OverlapIntegrator::new(id, sampler, p.mode, p.settings, accumulators, reweighter)
    }

    /// Run every worker to completion or cancellation and reduce.
    pub fn run(&self, cancel: &AtomicBool) -> Result<RunOutcome> {
        let p = &self.params;
        let shared = p.share_accumulator.then(|| self.new_accumulators());
        // restart statistics seed the shared set, or the merged one at the end
        if let Some(s) = &shared {
            self.load_restart(s);
        }
        let mut worker_accs = Vec::with_capacity(p.workers);
        let mut workers = Vec::with_capacity(p.workers);
        for id in 0..p.workers {
            let accs = match &shared {
                Some(s) => s.clone(),
                None => self.new_accumulators(),
            };
            workers.push(self.build_worker(id, accs.clone())?);
            worker_accs.push(accs);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(p.workers)
            .build()
            .map_err(|e| VirialError::InvalidParameter(format!("cannot start {} workers: {e}", p.workers)))?;
        info!("starting {} workers", p.workers);
        let results: Vec<(usize, Option<WorkerReport>)> = pool.install(|| {
            workers
                .into_par_iter()
                .map(|mut worker| {
                    let id = worker.id();
                    match panic::catch_unwind(AssertUnwindSafe(|| worker.run(cancel))) {
                        Ok(report) => (id, Some(report)),
                        Err(payload) => {
                            let message = payload
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic".to_string());
                            error!("worker {} terminated early: {}", id, message);
                            (id, None)
                        }
                    }
                })
                .collect()
        });

        let mut reports = Vec::new();
        let mut failed = Vec::new();
        for (id, report) in results {
            match report {
                Some(r) => reports.push(r),
                None => failed.push(id),
            }
        }
        if !failed.is_empty() {
            warn!("{} of {} workers failed; their recorded samples are kept", failed.len(), p.workers);
        }

        let accumulators = match shared {
            Some(s) => s,
            None => {
                let merged = self.new_accumulators();
                for accs in &worker_accs {
                    for (m, a) in merged.iter().zip(accs) {
                        m.merge_from(a);
                    }
                }
                self.load_restart(&merged);
                merged
            }
        };

        let summary = self.summarize(&accumulators, reports, failed);
        Ok(RunOutcome { summary, accumulators })
    }

    fn summarize(
        &self,
        accumulators: &[Arc<BinnedAccumulator>],
        workers: Vec<WorkerReport>,
        failed_workers: Vec<usize>,
    ) -> RunSummary {
        let estimates: Vec<Estimate> = accumulators.iter().map(|a| a.estimate()).collect();
        for (b, est) in estimates.iter().enumerate() {
            info!(
                "box {}: {} of {} samples measured, {} blocks, inefficiency {:?}",
                b, est.sampled, est.unscreened, est.blocks, est.inefficiency
            );
        }
        let ratios = match (self.params.mode, estimates.as_slice()) {
            (SamplingMode::Overlap, [box0, box1]) => combine_ratios(box0, box1),
            (_, [only, ..]) => only.ratios.clone(),
            _ => Vec::new(),
        };
        let n = self.systems.n_points();
        let orders = ratios
            .into_iter()
            .enumerate()
            .map(|(k, r)| OrderEstimate::new(k, r, n, self.systems.reference_integral))
            .collect();
        RunSummary {
            n_points: n,
            temperature: self.params.temperature,
            mode: self.params.mode,
            reference: self.params.reference,
            reference_integral: self.systems.reference_integral,
            orders,
            samples: accumulators.iter().map(|a| a.total()).collect(),
            bins: accumulators.iter().map(|a| a.len()).collect(),
            workers,
            failed_workers,
        }
    }

    /// Write the raw statistics and weights files the parameters ask for.
    pub fn publish(&self, outcome: &RunOutcome) -> Result<()> {
        let n_boxes = outcome.accumulators.len();
        for (b, acc) in outcome.accumulators.iter().enumerate() {
            if let Some(path) = &self.params.raw_output {
                let p = bins::box_path(path, b, n_boxes);
                bins::write_raw(&p, acc)?;
                info!("raw statistics of box {} written to {}", b, p.display());
            }
            if let Some(path) = &self.params.weights_output {
                let p = bins::box_path(path, b, n_boxes);
                bins::write_weights(&p, acc)?;
                info!("bin weights of box {} written to {}", b, p.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::{LennardJones, Potential};
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn hard_sphere_params() -> RunParams {
        RunParams {
            n_points: 3,
            temperature: 1.0,
            bond: BondFunction::HardSphere { sigma: 1.0 },
            triplet: None,
            cluster: ClusterKind::Flexible,
            reference: ReferenceKind::HardSphere { sigma: 1.0 },
            mode: SamplingMode::Overlap,
            weighting: BoxWeighting::Direct,
            reference_moves: vec![MoveSpec::Translate { step: 0.4, weight: 1.0 }],
            target_moves: vec![MoveSpec::Translate { step: 0.4, weight: 1.0 }],
            settings: IntegratorSettings {
                block_size: 20,
                equilibration_steps: 2,
                production_steps: 5,
                alpha_interval: 1,
                ..IntegratorSettings::default()
            },
            workers: 2,
            seed: 7,
            alpha: 1.0,
            seed_radius: 0.3,
            nominal_weight: 1.0,
            min_weight: 0.01,
            share_accumulator: false,
            restart_raw: None,
            restart_weights: None,
            raw_output: None,
            weights_output: None,
            summary_output: None,
        }
    }

    #[test]
    fn test_bad_reference_fails_before_sampling() {
        let mut params = hard_sphere_params();
        params.reference = ReferenceKind::HardSphere { sigma: 0.0 };
        assert!(matches!(
            WorkerCoordinator::new(params),
            Err(VirialError::InvalidReference(_))
        ));
        let mut params = hard_sphere_params();
        params.reference = ReferenceKind::HardSphere { sigma: -1.0 };
        assert!(WorkerCoordinator::new(params).is_err());
    }

    #[test]
    fn test_parameter_validation() {
        let mut params = hard_sphere_params();
        params.workers = 0;
        assert!(WorkerCoordinator::new(params).is_err());
        let mut params = hard_sphere_params();
        params.cluster = ClusterKind::NonadditiveB3;
        assert!(WorkerCoordinator::new(params).is_err());
        let mut params = hard_sphere_params();
        params.bond = BondFunction::Mayer(Potential::LennardJones(LennardJones::new(1.0, 1.0)));
        params.temperature = -1.0;
        assert!(WorkerCoordinator::new(params).is_err());
    }

    #[test]
    fn test_private_accumulators_merge_every_worker() {
        let coordinator = WorkerCoordinator::new(hard_sphere_params()).unwrap();
        let outcome = coordinator.run(&AtomicBool::new(false)).unwrap();
        let s = &outcome.summary;
        assert_eq!(s.workers.len(), 2);
        assert!(s.failed_workers.is_empty());
        assert_eq!(s.samples.iter().sum::<u64>(), 2 * 5 * 20);
        assert_relative_eq!(s.orders[0].ratio, 1.0, max_relative = 1e-12);
        // B3 of hard spheres is 5/8 · b², b = 2πσ³/3
        let b = 2.0 * PI / 3.0;
        assert_relative_eq!(s.orders[0].coefficient, 0.625 * b * b, max_relative = 1e-10);
    }

    #[test]
    fn test_shared_accumulator() {
        let mut params = hard_sphere_params();
        params.share_accumulator = true;
        let coordinator = WorkerCoordinator::new(params).unwrap();
        let outcome = coordinator.run(&AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.summary.samples.iter().sum::<u64>(), 2 * 5 * 20);
    }

    #[test]
    fn test_cancelled_run_still_reports() {
        let coordinator = WorkerCoordinator::new(hard_sphere_params()).unwrap();
        let outcome = coordinator.run(&AtomicBool::new(true)).unwrap();
        assert!(outcome.summary.workers.iter().all(|w| w.cancelled));
        assert_eq!(outcome.summary.samples.iter().sum::<u64>(), 0);
    }
}
