//! Reference and target boxes with their cached bond matrices and cluster
//! values.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::accumulator::BinKey;
use crate::bond::BondMatrix;
use crate::cluster::reference::ReferenceKind;
use crate::cluster::{ClusterSystem, ClusterValue};
use crate::error::{Result, VirialError};
use crate::geometry::Configuration;
use crate::moves::{AcceptanceBand, MoveContext, MoveSet};

/// Distribution each box samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BoxWeighting {
    /// Box b samples |γ_b|
    #[serde(rename = "direct")]
    #[default]
    Direct,
    /// Both boxes sample |γ₀| + |γ₁|/α
    #[serde(rename = "umbrella")]
    Umbrella,
}

/// Reference system with its exact integral plus the target system.
#[derive(Debug, Clone)]
pub struct SystemPair {
    pub reference: ClusterSystem,
    pub target: ClusterSystem,
    pub reference_integral: f64,
}

impl SystemPair {
    /// Fails before any sampling when the reference integral is unusable.
    pub fn new(reference: &ReferenceKind, target: ClusterSystem) -> Result<Self> {
        let n = target.n_points();
        let reference_integral = reference.integral(n)?;
        let reference = ClusterSystem::new(reference.bond(), reference.cluster(n)?, target.beta);
        Ok(SystemPair {
            reference,
            target,
            reference_integral,
        })
    }

    pub fn n_points(&self) -> usize {
        self.target.n_points()
    }

    pub fn n_orders(&self) -> usize {
        self.target.n_orders()
    }

    fn system(&self, index: usize) -> &ClusterSystem {
        if index == 0 {
            &self.reference
        } else {
            &self.target
        }
    }
}

fn box_weight(
    weighting: BoxWeighting,
    index: usize,
    alpha: f64,
    reference: &ClusterValue,
    target: Option<&ClusterValue>,
) -> f64 {
    let g0 = reference.value.abs();
    let g1 = target.map_or(0.0, |t| t.value.abs());
    match (weighting, index) {
        (BoxWeighting::Umbrella, _) => g0 + g1 / alpha,
        (BoxWeighting::Direct, 0) => g0,
        (BoxWeighting::Direct, _) => g1,
    }
}

/// One configuration and everything cached about it.
pub struct ClusterBox {
    config: Configuration,
    seed: Configuration,
    ref_bonds: BondMatrix,
    tgt_bonds: BondMatrix,
    scratch_ref: BondMatrix,
    scratch_tgt: BondMatrix,
    reference: ClusterValue,
    /// Cached when the weight or the overlap function needs it
    target: Option<ClusterValue>,
    weight: f64,
    moves: MoveSet,
    needs_target: bool,
    /// Times the box fell back to its seed layout
    pub resets: u64,
    /// Non-finite cluster values replaced by zero
    pub sanitized: u64,
}

impl ClusterBox {
    fn new(systems: &SystemPair, seed: Configuration, moves: MoveSet, needs_target: bool) -> Self {
        let ref_bonds = systems.reference.bond_matrix(&seed);
        let tgt_bonds = systems.target.bond_matrix(&seed);
        let reference = systems.reference.evaluate(&ref_bonds);
        let target = needs_target.then(|| systems.target.evaluate(&tgt_bonds));
        ClusterBox {
            config: seed.clone(),
            seed,
            scratch_ref: ref_bonds.clone(),
            scratch_tgt: tgt_bonds.clone(),
            ref_bonds,
            tgt_bonds,
            reference,
            target,
            weight: 0.0,
            moves,
            needs_target,
            resets: 0,
            sanitized: 0,
        }
    }

    fn reset_to_seed(&mut self, systems: &SystemPair) {
        self.config = self.seed.clone();
        self.ref_bonds = systems.reference.bond_matrix(&self.config);
        self.tgt_bonds = systems.target.bond_matrix(&self.config);
        self.reference = systems.reference.evaluate(&self.ref_bonds);
        self.target = self
            .needs_target
            .then(|| systems.target.evaluate(&self.tgt_bonds));
        self.resets += 1;
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn reference_value(&self) -> &ClusterValue {
        &self.reference
    }

    pub fn target_bonds(&self) -> &BondMatrix {
        &self.tgt_bonds
    }

    pub fn moves(&self) -> &MoveSet {
        &self.moves
    }

    /// Bin key from the target bond topology.
    pub fn key(&self) -> BinKey {
        BinKey::from_counts(&self.tgt_bonds.edge_counts())
    }
}

/// What a box contributes to the measurements of one step.
#[derive(Debug, Clone)]
pub struct BoxSample<'a> {
    pub key: BinKey,
    pub reference: &'a ClusterValue,
    /// Present when the box caches it
    pub target: Option<&'a ClusterValue>,
    pub weight: f64,
}

/// The two coupled chains of an overlap run, or the reference chain alone
/// for direct sampling.
pub struct DualBoxSampler {
    systems: Arc<SystemPair>,
    boxes: Vec<ClusterBox>,
    weighting: BoxWeighting,
    alpha: f64,
    rng: StdRng,
}

impl DualBoxSampler {
    /// `moves` holds one move set per box: two for overlap sampling, one for
    /// direct sampling of the reference.
    pub fn new(
        systems: Arc<SystemPair>,
        weighting: BoxWeighting,
        moves: Vec<MoveSet>,
        seed: Configuration,
        alpha: f64,
        rng: StdRng,
    ) -> Result<Self> {
        if moves.is_empty() || moves.len() > 2 {
            return Err(VirialError::InvalidParameter(format!(
                "expected one or two move sets, got {}",
                moves.len()
            )));
        }
        if seed.len() != systems.n_points() {
            return Err(VirialError::InvalidParameter(format!(
                "seed layout has {} points, cluster has {}",
                seed.len(),
                systems.n_points()
            )));
        }
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(VirialError::InvalidParameter(format!(
                "reference preference must be positive, got {alpha}"
            )));
        }
        let single = moves.len() == 1;
        let weighting = if single { BoxWeighting::Direct } else { weighting };
        let boxes = moves
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                // box 0 caches the target only when its weight depends on it;
                // otherwise it is evaluated for measured samples alone
                let needs_target = i == 1 || weighting == BoxWeighting::Umbrella;
                ClusterBox::new(&systems, seed.clone(), m, needs_target)
            })
            .collect();
        let mut sampler = DualBoxSampler {
            systems,
            boxes,
            weighting,
            alpha,
            rng,
        };
        for i in 0..sampler.boxes.len() {
            let weight = sampler.compute_weight(i);
            if !(weight > 0.0 && weight.is_finite()) {
                return Err(VirialError::InvalidConfiguration {
                    box_index: i,
                    message: format!("sampling weight of the seed layout is {weight}"),
                });
            }
            sampler.boxes[i].weight = weight;
        }
        Ok(sampler)
    }

    fn compute_weight(&self, index: usize) -> f64 {
        let bx = &self.boxes[index];
        box_weight(self.weighting, index, self.alpha, &bx.reference, bx.target.as_ref())
    }

    pub fn n_boxes(&self) -> usize {
        self.boxes.len()
    }

    pub fn systems(&self) -> &SystemPair {
        &self.systems
    }

    pub fn weighting(&self) -> BoxWeighting {
        self.weighting
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn boxes(&self) -> &[ClusterBox] {
        &self.boxes
    }

    /// Change the reference preference and refresh the cached weights.
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
        if self.weighting != BoxWeighting::Umbrella {
            return;
        }
        for i in 0..self.boxes.len() {
            self.refresh_weight(i);
        }
    }

    fn refresh_weight(&mut self, index: usize) {
        let weight = self.compute_weight(index);
        if weight > 0.0 && weight.is_finite() {
            self.boxes[index].weight = weight;
            return;
        }
        warn!("box {} has sampling weight {}, resetting to seed layout", index, weight);
        self.boxes[index].reset_to_seed(&self.systems);
        self.boxes[index].weight = self.compute_weight(index);
    }

    /// One trial move on box `index`, accepted on the box's sampling weight.
    /// Returns whether the move was accepted.
    pub fn step_box(&mut self, index: usize) -> bool {
        let DualBoxSampler {
            systems,
            boxes,
            weighting,
            alpha,
            rng,
        } = self;
        let bx = &mut boxes[index];
        let system = systems.system(index);
        let ctx = MoveContext {
            bond: &system.bond,
            beta: system.beta,
        };

        let k = bx.moves.choose(rng);
        let mv = bx.moves.get_mut(k);
        let ln_q = mv.propose(&mut bx.config, &ctx, rng);
        let moved = mv.moved().to_vec();

        bx.scratch_ref.clone_from(&bx.ref_bonds);
        bx.scratch_tgt.clone_from(&bx.tgt_bonds);
        systems.reference.update_bonds(&mut bx.ref_bonds, &bx.config, &moved);
        systems.target.update_bonds(&mut bx.tgt_bonds, &bx.config, &moved);

        let reference = systems.reference.evaluate(&bx.ref_bonds);
        let target = bx
            .needs_target
            .then(|| systems.target.evaluate(&bx.tgt_bonds));
        let weight = box_weight(*weighting, index, *alpha, &reference, target.as_ref());

        let ln_ratio = (weight / bx.weight).ln() + ln_q;
        let accept = weight > 0.0
            && weight.is_finite()
            && (ln_ratio >= 0.0 || rng.gen::<f64>() < ln_ratio.exp());

        let mv = bx.moves.get_mut(k);
        if accept {
            mv.accept();
            if reference.sanitized || target.as_ref().is_some_and(|t| t.sanitized) {
                bx.sanitized += 1;
            }
            bx.reference = reference;
            bx.target = target;
            bx.weight = weight;
        } else {
            mv.reject(&mut bx.config);
            std::mem::swap(&mut bx.ref_bonds, &mut bx.scratch_ref);
            std::mem::swap(&mut bx.tgt_bonds, &mut bx.scratch_tgt);
        }
        accept
    }

    pub fn tune_moves(&mut self, band: &AcceptanceBand) -> usize {
        self.boxes.iter_mut().map(|b| b.moves.tune(band)).sum()
    }

    pub fn sample(&self, index: usize) -> BoxSample<'_> {
        let bx = &self.boxes[index];
        BoxSample {
            key: bx.key(),
            reference: &bx.reference,
            target: bx.target.as_ref(),
            weight: bx.weight,
        }
    }

    /// Target value of box `index`, evaluated on demand when not cached.
    pub fn target_value(&self, index: usize) -> ClusterValue {
        let bx = &self.boxes[index];
        match &bx.target {
            Some(t) => t.clone(),
            None => self.systems.target.evaluate(&bx.tgt_bonds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::BondFunction;
    use crate::cluster::Cluster;
    use crate::moves::MoveSpec;
    use crate::potential::{LennardJones, Potential};
    use rand::SeedableRng;

    fn lj_pair(n: usize) -> Arc<SystemPair> {
        let bond = BondFunction::Mayer(Potential::LennardJones(LennardJones::new(1.0, 1.0)));
        let target = ClusterSystem::new(bond, Cluster::flexible(n, &bond).unwrap(), 1.0);
        Arc::new(SystemPair::new(&ReferenceKind::HardSphere { sigma: 1.5 }, target).unwrap())
    }

    fn moves(n: usize) -> MoveSet {
        MoveSet::from_specs(&[MoveSpec::Translate { step: 0.5, weight: 1.0 }], n).unwrap()
    }

    #[test]
    fn test_rejected_step_keeps_cached_state() {
        let systems = lj_pair(4);
        let mut sampler = DualBoxSampler::new(
            systems.clone(),
            BoxWeighting::Direct,
            vec![moves(4), moves(4)],
            Configuration::seed_layout(4, 0.6),
            1.0,
            StdRng::seed_from_u64(3),
        )
        .unwrap();
        let mut rejected = 0;
        for _ in 0..500 {
            for b in 0..2 {
                let before = sampler.boxes()[b].config().clone();
                let value = sampler.boxes()[b].reference_value().clone();
                let weight = sampler.boxes()[b].weight();
                if !sampler.step_box(b) {
                    rejected += 1;
                    let bx = &sampler.boxes()[b];
                    assert!(bx.config().bitwise_eq(&before));
                    assert_eq!(bx.reference_value(), &value);
                    assert_eq!(bx.weight(), weight);
                }
                // cached bonds always describe the current positions
                let bx = &sampler.boxes()[b];
                assert_eq!(bx.target_bonds(), &systems.target.bond_matrix(bx.config()));
            }
        }
        assert!(rejected > 0);
    }

    #[test]
    fn test_zero_seed_weight_is_fatal() {
        let systems = lj_pair(3);
        // points far apart: no hard-sphere overlap at all
        let seed = Configuration::seed_layout(3, 10.0);
        let result = DualBoxSampler::new(
            systems,
            BoxWeighting::Direct,
            vec![moves(3), moves(3)],
            seed,
            1.0,
            StdRng::seed_from_u64(1),
        );
        assert!(matches!(
            result,
            Err(VirialError::InvalidConfiguration { box_index: 0, .. })
        ));
    }

    #[test]
    fn test_umbrella_weight_follows_alpha() {
        let mut sampler = DualBoxSampler::new(
            lj_pair(3),
            BoxWeighting::Umbrella,
            vec![moves(3), moves(3)],
            Configuration::seed_layout(3, 0.6),
            1.0,
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        let w1 = sampler.boxes()[0].weight();
        sampler.set_alpha(2.0);
        let sample = sampler.sample(0);
        let g0 = sample.reference.value.abs();
        let g1 = sample.target.map(|t| t.value.abs()).unwrap();
        assert_eq!(sample.weight, g0 + g1 / 2.0);
        assert!(sample.weight < w1);
    }

    #[test]
    fn test_direct_mode_evaluates_target_on_demand() {
        let systems = lj_pair(3);
        let sampler = DualBoxSampler::new(
            systems.clone(),
            BoxWeighting::Umbrella,
            vec![moves(3)],
            Configuration::seed_layout(3, 0.6),
            1.0,
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        assert_eq!(sampler.weighting(), BoxWeighting::Direct);
        let sample = sampler.sample(0);
        assert!(sample.target.is_none());
        let bonds = systems.target.bond_matrix(sampler.boxes()[0].config());
        assert_eq!(sampler.target_value(0), systems.target.evaluate(&bonds));
    }

    #[test]
    fn test_reference_box_target_cached_only_for_umbrella() {
        let build = |weighting| {
            DualBoxSampler::new(
                lj_pair(3),
                weighting,
                vec![moves(3), moves(3)],
                Configuration::seed_layout(3, 0.6),
                1.0,
                StdRng::seed_from_u64(5),
            )
            .unwrap()
        };
        let mut direct = build(BoxWeighting::Direct);
        for _ in 0..50 {
            direct.step_box(0);
            direct.step_box(1);
        }
        assert!(direct.sample(0).target.is_none());
        assert!(direct.sample(1).target.is_some());
        let bonds = direct.systems().target.bond_matrix(direct.boxes()[0].config());
        assert_eq!(direct.target_value(0), direct.systems().target.evaluate(&bonds));

        let umbrella = build(BoxWeighting::Umbrella);
        assert!(umbrella.sample(0).target.is_some());
    }
}
