use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::Rng;

use super::{random_free_point, AcceptanceBand, MoveContext, MoveDelta, MoveStats, StepSize, TrialMove};
use crate::geometry::Configuration;

/// Displace one free point uniformly within a cube of half-width `step`.
#[derive(Debug, Clone)]
pub struct Translate {
    step: StepSize,
    moved: Vec<usize>,
    delta: MoveDelta,
    stats: MoveStats,
}

impl Translate {
    pub fn new(step: f64) -> Self {
        Translate {
            step: StepSize::new(step, step * 1e-3, step * 100.0),
            moved: Vec::with_capacity(1),
            delta: MoveDelta::default(),
            stats: MoveStats::new(),
        }
    }
}

impl TrialMove for Translate {
    fn name(&self) -> &'static str {
        "translate"
    }

    fn propose(&mut self, config: &mut Configuration, _ctx: &MoveContext, rng: &mut StdRng) -> f64 {
        let idx = random_free_point(config.len(), rng);
        self.moved.clear();
        self.moved.push(idx);
        self.delta.save(config, &self.moved);

        let s = self.step.value;
        let displacement = Vector3::new(
            s * (2.0 * rng.gen::<f64>() - 1.0),
            s * (2.0 * rng.gen::<f64>() - 1.0),
            s * (2.0 * rng.gen::<f64>() - 1.0),
        );
        config.set_position(idx, config.position(idx) + displacement);
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
        Some(self.step.value)
    }

    fn tune(&mut self, band: &AcceptanceBand) -> bool {
        self.step.retune(&mut self.stats, band)
    }
}
