use std::f64::consts::PI;

use nalgebra::{Rotation3, Unit, Vector3};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, UnitSphere};

use super::{random_free_point, AcceptanceBand, MoveContext, MoveDelta, MoveStats, StepSize, TrialMove};
use crate::geometry::Configuration;

/// Rotate one free point about the anchor by a random angle in
/// `[-angle, angle]` around a uniformly random axis.
///
/// The separation to the anchor is preserved, so for two points this only
/// changes orientation.
#[derive(Debug, Clone)]
pub struct Bend {
    angle: StepSize,
    moved: Vec<usize>,
    delta: MoveDelta,
    stats: MoveStats,
}

impl Bend {
    pub fn new(angle: f64) -> Self {
        Bend {
            angle: StepSize::new(angle, 1e-3, PI),
            moved: Vec::with_capacity(1),
            delta: MoveDelta::default(),
            stats: MoveStats::new(),
        }
    }
}

impl TrialMove for Bend {
    fn name(&self) -> &'static str {
        "bend"
    }

    fn propose(&mut self, config: &mut Configuration, _ctx: &MoveContext, rng: &mut StdRng) -> f64 {
        let idx = random_free_point(config.len(), rng);
        self.moved.clear();
        self.moved.push(idx);
        self.delta.save(config, &self.moved);

        let axis: [f64; 3] = UnitSphere.sample(rng);
        let axis = Unit::new_normalize(Vector3::from(axis));
        let theta = self.angle.value * (2.0 * rng.gen::<f64>() - 1.0);
        let rotation = Rotation3::from_axis_angle(&axis, theta);

        let pivot = config.position(0);
        let arm = config.separation(0, idx);
        config.set_position(idx, pivot + rotation * arm);
        0.0
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

    fn step_size(&self) -> Option<f64> {
        Some(self.angle.value)
    }

    fn tune(&mut self, band: &AcceptanceBand) -> bool {
        self.angle.retune(&mut self.stats, band)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::BondFunction;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_bend_preserves_anchor_distance() {
        let bond = BondFunction::HardSphere { sigma: 1.0 };
        let ctx = MoveContext { bond: &bond, beta: 1.0 };
        let mut rng = StdRng::seed_from_u64(5);
        let mut cfg = Configuration::seed_layout(4, 0.8);
        let mut bend = Bend::new(1.0);
        for _ in 0..20 {
            let before = cfg.clone();
            bend.propose(&mut cfg, &ctx, &mut rng);
            let i = bend.moved()[0];
            assert_relative_eq!(cfg.distance2(0, i), before.distance2(0, i), epsilon = 1e-12);
            bend.accept();
        }
    }
}
