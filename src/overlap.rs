//! Bennett overlap bridge between the reference and target boxes.
//!
//! Box b samples a distribution π_b. With the overlap function
//! γ_OS = |γ₀||γ₁| / (|γ₁| + α|γ₀|) the ratio of the absolute integrals is
//!
//! Z₁/Z₀ = (⟨γ_OS/π₀⟩₀ / ⟨|γ₀|/π₀⟩₀) / (⟨γ_OS/π₁⟩₁ / ⟨|γ₁|/π₁⟩₁)
//!
//! for any α; the variance is smallest at α = Z₁/Z₀, which is found
//! self-consistently on a log-spaced grid while equilibrating.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accumulator::{measurement_values, BinKey, BinnedAccumulator, BlockTally, Estimate, Measured, RatioEstimate};
use crate::cluster::ClusterValue;

/// γ_OS for absolute reference and target values.
pub fn overlap_value(g0: f64, g1: f64, alpha: f64) -> f64 {
    let denom = g1 + alpha * g0;
    if denom == 0.0 {
        0.0
    } else {
        g0 * g1 / denom
    }
}

/// Γ₁⁽ᵏ⁾/Γ₀ from the two box estimates: box 0 gives ∫γ_OS/∫γ₀, box 1 gives
/// ∫γ₁⁽ᵏ⁾/∫γ_OS. Relative errors of the independent boxes add in quadrature.
pub fn combine_ratios(box0: &Estimate, box1: &Estimate) -> Vec<RatioEstimate> {
    let r0 = box0.ratios.first().copied().unwrap_or(RatioEstimate {
        ratio: f64::NAN,
        error: f64::NAN,
    });
    box1.ratios
        .iter()
        .map(|r1| {
            let ratio = r0.ratio * r1.ratio;
            let rel0 = r0.error / r0.ratio;
            let rel1 = r1.error / r1.ratio;
            RatioEstimate {
                ratio,
                error: ratio.abs() * (rel0 * rel0 + rel1 * rel1).sqrt(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlphaGrid {
    /// Number of grid points
    pub points: usize,
    /// Half-width of the grid in ln α
    pub span: f64,
    /// Smallest half-width after repeated narrowing
    pub min_span: f64,
}

impl Default for AlphaGrid {
    fn default() -> Self {
        AlphaGrid {
            points: 11,
            span: 10f64.ln(),
            min_span: 0.02,
        }
    }
}

/// Worker-private overlap state.
pub struct OverlapBridge {
    grid: AlphaGrid,
    alpha: f64,
    alphas: Vec<f64>,
    /// Σ γ_OS(α_j)/π_b per box and grid point
    overlap_sums: [Vec<f64>; 2],
    /// Σ |γ_b|/π_b per box
    abs_sums: [f64; 2],
    counts: [u64; 2],
    last_change: f64,
    frozen: bool,
    n_orders: usize,
    /// Unbinned running estimates per box, over weight-scaled measurements
    running: [BinnedAccumulator; 2],
    running_blocks: [BlockTally; 2],
}

fn single_key() -> BinKey {
    BinKey(vec![0])
}

impl OverlapBridge {
    pub fn new(alpha: f64, grid: AlphaGrid, n_orders: usize) -> Self {
        let mut bridge = OverlapBridge {
            grid,
            alpha,
            alphas: Vec::new(),
            overlap_sums: [Vec::new(), Vec::new()],
            abs_sums: [0.0; 2],
            counts: [0; 2],
            last_change: f64::INFINITY,
            frozen: false,
            n_orders,
            running: [BinnedAccumulator::new(1, 1.0, 1.0), BinnedAccumulator::new(n_orders, 1.0, 1.0)],
            running_blocks: [BlockTally::new(1), BlockTally::new(n_orders)],
        };
        bridge.reset_grid();
        bridge
    }

    fn reset_grid(&mut self) {
        let m = self.grid.points.max(1);
        self.alphas = (0..m)
            .map(|j| {
                let t = if m == 1 { 0.0 } else { 2.0 * j as f64 / (m - 1) as f64 - 1.0 };
                self.alpha * (self.grid.span * t).exp()
            })
            .collect();
        self.overlap_sums = [vec![0.0; m], vec![0.0; m]];
        self.abs_sums = [0.0; 2];
        self.counts = [0; 2];
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn span(&self) -> f64 {
        self.grid.span
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Fix α for production; grid sums are no longer needed.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the last retune moved ln α by less than `tolerance`.
    pub fn is_stable(&self, tolerance: f64) -> bool {
        self.last_change < tolerance
    }

    /// Feed one equilibration sample of box `b` into the α grid.
    pub fn accumulate(&mut self, b: usize, reference: &ClusterValue, target: &ClusterValue, pi: f64) {
        if self.frozen || pi <= 0.0 {
            return;
        }
        let g0 = reference.value.abs();
        let g1 = target.value.abs();
        let own = if b == 0 { g0 } else { g1 };
        self.abs_sums[b] += own / pi;
        self.counts[b] += 1;
        for (sum, &a) in self.overlap_sums[b].iter_mut().zip(&self.alphas) {
            *sum += overlap_value(g0, g1, a) / pi;
        }
    }

    /// Z₁/Z₀ estimated at grid point `j`, `None` while a sum is empty.
    pub fn estimate_at(&self, j: usize) -> Option<f64> {
        let (s0, s1) = (self.overlap_sums[0][j], self.overlap_sums[1][j]);
        let (a0, a1) = (self.abs_sums[0], self.abs_sums[1]);
        if s0 <= 0.0 || s1 <= 0.0 || a0 <= 0.0 || a1 <= 0.0 {
            return None;
        }
        Some((s0 / a0) / (s1 / a1))
    }

    /// Move α to the self-consistent point of the current grid and start a
    /// new one. Returns the new α when a retune happened.
    pub fn retune(&mut self) -> Option<f64> {
        if self.frozen || self.counts[0] == 0 || self.counts[1] == 0 {
            return None;
        }
        let m = self.alphas.len();
        let h: Option<Vec<f64>> = (0..m)
            .map(|j| self.estimate_at(j).map(|e| e.ln() - self.alphas[j].ln()))
            .collect();
        let h = h?;

        let log_alphas: Vec<f64> = self.alphas.iter().map(|a| a.ln()).collect();
        let crossing = (0..m.saturating_sub(1)).find(|&j| h[j] >= 0.0 && h[j + 1] < 0.0);
        let (new_log, narrowed) = match crossing {
            Some(j) => {
                let t = h[j] / (h[j] - h[j + 1]);
                (log_alphas[j] + t * (log_alphas[j + 1] - log_alphas[j]), true)
            }
            None if h[0] < 0.0 => (log_alphas[0], false),
            None => (log_alphas[m - 1], false),
        };
        let new_alpha = new_log.exp();
        self.last_change = (new_log - self.alpha.ln()).abs();
        debug!(
            "alpha {:.6} -> {:.6} (span {:.4}, samples {}/{})",
            self.alpha, new_alpha, self.grid.span, self.counts[0], self.counts[1]
        );
        self.alpha = new_alpha;
        if narrowed {
            self.grid.span = (self.grid.span * 0.5).max(self.grid.min_span);
        }
        self.reset_grid();
        Some(new_alpha)
    }

    /// Numerators and denominator measured in box `b`.
    ///
    /// Box 0 measures γ_OS/π₀ against γ₀/π₀; box 1 measures every order of
    /// γ₁/π₁ against γ_OS/π₁.
    pub fn measurement(&self, b: usize, reference: &ClusterValue, target: &ClusterValue, pi: f64) -> Vec<f64> {
        let overlap = overlap_value(reference.value.abs(), target.value.abs(), self.alpha) / pi;
        if b == 0 {
            measurement_values(&[overlap], reference.value / pi)
        } else {
            let nums: Vec<f64> = target.orders.iter().map(|g| g / pi).collect();
            measurement_values(&nums, overlap)
        }
    }

    /// Direct-sampling measurement: every target order against the reference,
    /// both divided by the reference box weight.
    pub fn direct_measurement(reference: &ClusterValue, target: &ClusterValue, pi: f64) -> Vec<f64> {
        let nums: Vec<f64> = target.orders.iter().map(|g| g / pi).collect();
        measurement_values(&nums, reference.value / pi)
    }

    /// Record a production sample of box `b` into the running estimates.
    /// Measurements are divided by the weight they were taken with and
    /// unmeasured samples count as zeros.
    pub fn record_running(&mut self, b: usize, measured: Option<&Measured>) {
        let k = self.running[b].n_orders();
        let values = match measured {
            Some(m) => {
                let (nums, den) = m.scaled(k);
                measurement_values(&nums, den)
            }
            None => vec![0.0; 2 * k + 1],
        };
        self.running[b].record(&single_key(), &values, 0.0);
        self.running_blocks[b].observe(Some(&Measured { values, weight: 1.0 }));
    }

    /// Close the current production block of both running estimates.
    pub fn commit_blocks(&mut self) {
        for (acc, tally) in self.running.iter().zip(&mut self.running_blocks) {
            acc.commit_block(tally);
        }
    }

    /// Running Γ₁⁽ᵏ⁾/Γ₀ with errors from this bridge's own samples.
    pub fn ratio_estimate(&self) -> Vec<RatioEstimate> {
        combine_ratios(&self.running[0].estimate(), &self.running[1].estimate())
    }

    pub fn n_orders(&self) -> usize {
        self.n_orders
    }

    /// Per-sample relative variance of a box's ratio, for step-fraction
    /// tuning. `None` until the box has measurements.
    pub fn relative_variance(&self, b: usize) -> Option<f64> {
        let est = self.running[b].estimate();
        let n = est.sampled as f64;
        let r = est.ratios.first()?;
        let rel = r.error / r.ratio;
        (n > 1.0 && rel.is_finite()).then_some(rel * rel * n)
    }
}
