//! Run configuration
//!
//! YAML sections map onto the structs below. Every scalar is optional in the
//! file; `with_defaults` fills the gaps, `validate` rejects what cannot run
//! and `to_run_params` flattens the result for the coordinator.

mod args;

pub use args::Args;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bond::{BondFunction, TripletFunction};
use crate::cluster::reference::ReferenceKind;
use crate::cluster::ClusterKind;
use crate::coordinator::RunParams;
use crate::error::{Result, VirialError};
use crate::integrator::{IntegratorSettings, SamplingMode};
use crate::moves::{AcceptanceBand, MoveSpec};
use crate::overlap::AlphaGrid;
use crate::potential::{AxilrodTeller, Potential};
use crate::sampler::BoxWeighting;

/// How the pair potential enters the bonds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BondStyle {
    #[serde(rename = "mayer")]
    #[default]
    Mayer,
    /// Square well with the well as a separate formal variable
    #[serde(rename = "split")]
    Split,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub points: usize,
    pub temperature: Option<f64>,
    pub potential: Potential,
    pub bond: Option<BondStyle>,
    pub three_body: Option<AxilrodTeller>,
    pub cluster: Option<ClusterKind>,
    pub reference: ReferenceKind,
    pub sampling: Option<SamplingParams>,
    pub acceptance: Option<AcceptanceBand>,
    pub moves: Option<MoveParams>,
    pub bins: Option<BinParams>,
    pub output: Option<OutputParams>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SamplingParams {
    pub mode: Option<SamplingMode>,
    pub weighting: Option<BoxWeighting>,
    pub workers: Option<usize>,
    pub seed: Option<u64>,
    pub alpha: Option<f64>,
    pub seed_radius: Option<f64>,
    pub block_size: Option<u64>,
    pub equilibration_steps: Option<u64>,
    pub production_steps: Option<u64>,
    pub alpha_interval: Option<u64>,
    pub alpha_grid: Option<AlphaGrid>,
    pub stabilise_tolerance: Option<f64>,
    pub tune_fraction: Option<bool>,
    pub timed_cost: Option<bool>,
    pub initial_fraction: Option<f64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        let s = IntegratorSettings::default();
        SamplingParams {
            mode: Some(SamplingMode::Overlap),
            weighting: Some(BoxWeighting::Direct),
            workers: Some(1),
            seed: Some(12345),
            alpha: Some(1.0),
            seed_radius: None,
            block_size: Some(s.block_size),
            equilibration_steps: Some(s.equilibration_steps),
            production_steps: Some(s.production_steps),
            alpha_interval: Some(s.alpha_interval),
            alpha_grid: Some(s.alpha_grid),
            stabilise_tolerance: None,
            tune_fraction: Some(s.tune_fraction),
            timed_cost: Some(s.timed_cost),
            initial_fraction: Some(s.initial_fraction),
        }
    }
}

impl SamplingParams {
    /// Apply default values to any missing parameters
    pub fn with_defaults(mut self) -> Self {
        let d = Self::default();
        self.mode = self.mode.or(d.mode);
        self.weighting = self.weighting.or(d.weighting);
        self.workers = self.workers.or(d.workers);
        self.seed = self.seed.or(d.seed);
        self.alpha = self.alpha.or(d.alpha);
        self.block_size = self.block_size.or(d.block_size);
        self.equilibration_steps = self.equilibration_steps.or(d.equilibration_steps);
        self.production_steps = self.production_steps.or(d.production_steps);
        self.alpha_interval = self.alpha_interval.or(d.alpha_interval);
        self.alpha_grid = self.alpha_grid.or(d.alpha_grid);
        self.tune_fraction = self.tune_fraction.or(d.tune_fraction);
        self.timed_cost = self.timed_cost.or(d.timed_cost);
        self.initial_fraction = self.initial_fraction.or(d.initial_fraction);
        self
    }
}

/// Move lists per box; a missing list gets a sensible default
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MoveParams {
    pub reference: Option<Vec<MoveSpec>>,
    pub target: Option<Vec<MoveSpec>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BinParams {
    pub nominal_weight: Option<f64>,
    pub min_weight: Option<f64>,
    pub shared: Option<bool>,
    pub reweight_interval: Option<u64>,
    pub cost_ratio: Option<f64>,
}

impl Default for BinParams {
    fn default() -> Self {
        BinParams {
            nominal_weight: Some(1.0),
            min_weight: Some(0.01),
            shared: Some(false),
            reweight_interval: Some(0),
            cost_ratio: Some(1.0),
        }
    }
}

impl BinParams {
    pub fn with_defaults(mut self) -> Self {
        let d = Self::default();
        self.nominal_weight = self.nominal_weight.or(d.nominal_weight);
        self.min_weight = self.min_weight.or(d.min_weight);
        self.shared = self.shared.or(d.shared);
        self.reweight_interval = self.reweight_interval.or(d.reweight_interval);
        self.cost_ratio = self.cost_ratio.or(d.cost_ratio);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct OutputParams {
    pub raw: Option<PathBuf>,
    pub weights: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub restart_raw: Option<PathBuf>,
    pub restart_weights: Option<PathBuf>,
}

impl Config {
    /// Parse a YAML document and fill in defaults.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yml::Error> {
        Ok(serde_yml::from_str::<Config>(text)?.with_defaults())
    }

    pub fn with_defaults(mut self) -> Self {
        self.temperature = self.temperature.or(Some(1.0));
        self.bond = self.bond.or(Some(BondStyle::Mayer));
        self.cluster = self.cluster.or(Some(ClusterKind::Flexible));
        self.sampling = Some(self.sampling.unwrap_or_default().with_defaults());
        self.acceptance = self.acceptance.or(Some(AcceptanceBand::default()));
        self.bins = Some(self.bins.unwrap_or_default().with_defaults());
        self.moves = Some(self.moves.unwrap_or_default());
        self.output = Some(self.output.unwrap_or_default());
        self
    }

    /// Command-line values win over the file.
    pub fn apply_overrides(&mut self, args: &Args) {
        if let Some(t) = args.temperature {
            self.temperature = Some(t);
        }
        let sampling = self.sampling.get_or_insert_with(SamplingParams::default);
        if args.workers.is_some() {
            sampling.workers = args.workers;
        }
        if args.seed.is_some() {
            sampling.seed = args.seed;
        }
        if args.steps.is_some() {
            sampling.production_steps = args.steps;
        }
        if args.equilibration_steps.is_some() {
            sampling.equilibration_steps = args.equilibration_steps;
        }
        let output = self.output.get_or_insert_with(OutputParams::default);
        if args.raw.is_some() {
            output.raw = args.raw.clone();
        }
        if args.weights.is_some() {
            output.weights = args.weights.clone();
        }
        if args.summary.is_some() {
            output.summary = args.summary.clone();
        }
    }

    fn bond_function(&self) -> Result<BondFunction> {
        match (self.bond.unwrap_or_default(), self.potential) {
            (BondStyle::Split, Potential::SquareWell(sw)) => Ok(BondFunction::SquareWellSplit(sw)),
            (BondStyle::Split, other) => Err(VirialError::InvalidParameter(format!(
                "split bonds need a square-well potential, got {other:?}"
            ))),
            (BondStyle::Mayer, Potential::HardSphere(hs)) => Ok(BondFunction::HardSphere { sigma: hs.sigma }),
            (BondStyle::Mayer, p) => Ok(BondFunction::Mayer(p)),
        }
    }

    /// Moves used when the file lists none: translation in the target box,
    /// plus exact regrowth of the reference when it has a tree or chain form.
    fn default_moves(&self, target: bool) -> Vec<MoveSpec> {
        let sigma = self.reference.sigma();
        let translate = MoveSpec::Translate {
            step: 0.5 * sigma,
            weight: 1.0,
        };
        match (target, self.reference) {
            (false, ReferenceKind::Tree { sigma }) => vec![MoveSpec::TreeRegrow { sigma, weight: 1.0 }],
            (false, ReferenceKind::Chain { sigma }) => vec![MoveSpec::ChainRegrow { sigma, weight: 1.0 }],
            _ => vec![translate],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.points < 2 {
            return Err(VirialError::UnsupportedPoints {
                n: self.points,
                what: "virial coefficients",
                supported: "n >= 2",
            });
        }
        if !(self.reference.sigma() > 0.0) {
            return Err(VirialError::InvalidReference(format!(
                "reference diameter must be positive, got {}",
                self.reference.sigma()
            )));
        }
        self.bond_function()?;
        self.to_run_params()?.validate()
    }

    pub fn to_run_params(&self) -> Result<RunParams> {
        let sampling = self.sampling.clone().unwrap_or_default().with_defaults();
        let bins = self.bins.clone().unwrap_or_default().with_defaults();
        let moves = self.moves.clone().unwrap_or_default();
        let output = self.output.clone().unwrap_or_default();
        let base = IntegratorSettings::default();
        let settings = IntegratorSettings {
            block_size: sampling.block_size.unwrap_or(base.block_size),
            equilibration_steps: sampling.equilibration_steps.unwrap_or(base.equilibration_steps),
            production_steps: sampling.production_steps.unwrap_or(base.production_steps),
            alpha_interval: sampling.alpha_interval.unwrap_or(base.alpha_interval),
            alpha_grid: sampling.alpha_grid.unwrap_or(base.alpha_grid),
            stabilise_tolerance: sampling.stabilise_tolerance,
            band: self.acceptance.unwrap_or_default(),
            reweight_interval: bins.reweight_interval.unwrap_or(base.reweight_interval),
            cost_ratio: bins.cost_ratio.unwrap_or(base.cost_ratio),
            tune_fraction: sampling.tune_fraction.unwrap_or(base.tune_fraction),
            timed_cost: sampling.timed_cost.unwrap_or(base.timed_cost),
            initial_fraction: sampling.initial_fraction.unwrap_or(base.initial_fraction),
        };
        Ok(RunParams {
            n_points: self.points,
            temperature: self.temperature.unwrap_or(1.0),
            bond: self.bond_function()?,
            triplet: self.three_body.map(|potential| TripletFunction { potential }),
            cluster: self.cluster.clone().unwrap_or(ClusterKind::Flexible),
            reference: self.reference,
            mode: sampling.mode.unwrap_or_default(),
            weighting: sampling.weighting.unwrap_or_default(),
            reference_moves: moves.reference.unwrap_or_else(|| self.default_moves(false)),
            target_moves: moves.target.unwrap_or_else(|| self.default_moves(true)),
            settings,
            workers: sampling.workers.unwrap_or(1),
            seed: sampling.seed.unwrap_or(12345),
            alpha: sampling.alpha.unwrap_or(1.0),
            // every seed pair overlaps the reference core
            seed_radius: sampling.seed_radius.unwrap_or(0.2 * self.reference.sigma()),
            nominal_weight: bins.nominal_weight.unwrap_or(1.0),
            min_weight: bins.min_weight.unwrap_or(0.01),
            share_accumulator: bins.shared.unwrap_or(false),
            restart_raw: output.restart_raw,
            restart_weights: output.restart_weights,
            raw_output: output.raw,
            weights_output: output.weights,
            summary_output: output.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::LennardJones;

    const LJ_B3: &str = r#"
points: 3
temperature: 1.0
potential:
  type: lennard_jones
  epsilon: 1.0
  sigma: 1.0
reference:
  type: hard_sphere
  sigma: 1.5
sampling:
  workers: 2
  production_steps: 50
moves:
  target:
    - type: translate
      step: 0.5
    - type: bend
      angle: 1.0
      weight: 0.5
"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = Config::from_yaml(LJ_B3).unwrap();
        config.validate().unwrap();
        let params = config.to_run_params().unwrap();
        assert_eq!(params.n_points, 3);
        assert_eq!(params.workers, 2);
        assert_eq!(params.settings.production_steps, 50);
        assert_eq!(params.settings.block_size, IntegratorSettings::default().block_size);
        assert_eq!(params.mode, SamplingMode::Overlap);
        assert_eq!(params.cluster, ClusterKind::Flexible);
        assert_eq!(
            params.bond,
            BondFunction::Mayer(Potential::LennardJones(LennardJones::new(1.0, 1.0)))
        );
        assert_eq!(params.target_moves.len(), 2);
        assert_eq!(params.target_moves[1].weight(), 0.5);
        // no reference moves listed: translation scaled to the reference
        assert_eq!(
            params.reference_moves,
            vec![MoveSpec::Translate { step: 0.75, weight: 1.0 }]
        );
    }

    #[test]
    fn test_overrides_win() {
        let mut config = Config::from_yaml(LJ_B3).unwrap();
        let args = Args {
            workers: Some(4),
            steps: Some(7),
            temperature: Some(2.0),
            ..Args::default()
        };
        config.apply_overrides(&args);
        let params = config.to_run_params().unwrap();
        assert_eq!(params.workers, 4);
        assert_eq!(params.settings.production_steps, 7);
        assert_eq!(params.temperature, 2.0);
    }

    #[test]
    fn test_split_bonds_need_square_well() {
        let text = LJ_B3.replace("temperature: 1.0", "temperature: 1.0\nbond: split");
        let config = Config::from_yaml(&text).unwrap();
        assert!(config.validate().is_err());

        let sw = r#"
points: 4
bond: split
potential: { type: square_well, sigma: 1.0, lambda: 1.5, epsilon: 1.0 }
reference: { type: tree, sigma: 1.5 }
sampling: { mode: direct }
"#;
        let config = Config::from_yaml(sw).unwrap();
        let params = config.to_run_params().unwrap();
        assert!(matches!(params.bond, BondFunction::SquareWellSplit(_)));
        assert_eq!(params.reference_moves, vec![MoveSpec::TreeRegrow { sigma: 1.5, weight: 1.0 }]);
        params.validate().unwrap();
    }

    #[test]
    fn test_unknown_fields_are_parse_errors() {
        assert!(Config::from_yaml("points: 3\npotential: { type: nope }\nreference: { type: tree, sigma: 1 }").is_err());
    }
}
