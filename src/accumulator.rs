//! Statistics binned by a coarse topological key.
//!
//! Every recorded sample counts towards its bin's unscreened total; only a
//! fraction `weight` of them is actually measured and stored. Estimates are
//! stratified: per-bin means weighted by the unscreened fractions. Each
//! sample carries K numerators, one denominator and the K numerator ×
//! denominator products, so ratio errors can include the covariance.
//!
//! Consecutive Markov-chain samples are correlated. Workers also hand in
//! per-block totals, and the ratio variance of the block totals over that of
//! the individual samples (the statistical inefficiency) scales the error.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Coarse classification of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinKey(pub Vec<u32>);

impl BinKey {
    pub fn from_counts(counts: &[u32]) -> Self {
        BinKey(counts.to_vec())
    }
}

impl fmt::Display for BinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl FromStr for BinKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty bin key".to_string());
        }
        s.split(',')
            .map(|p| p.parse::<u32>().map_err(|e| format!("bad bin key component '{p}': {e}")))
            .collect::<Result<Vec<_>, _>>()
            .map(BinKey)
    }
}

/// Packs numerators and a denominator into the stored layout.
pub fn measurement_values(numerators: &[f64], denominator: f64) -> Vec<f64> {
    let mut values = Vec::with_capacity(2 * numerators.len() + 1);
    values.extend_from_slice(numerators);
    values.push(denominator);
    values.extend(numerators.iter().map(|x| x * denominator));
    values
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinStats {
    /// Samples that fell in this bin
    pub unscreened: u64,
    /// Samples actually measured
    pub sampled: u64,
    pub sum: Vec<f64>,
    pub sum_sq: Vec<f64>,
    /// Probability of measuring a sample that falls in this bin
    pub weight: f64,
}

impl BinStats {
    pub fn new(n_values: usize, weight: f64) -> Self {
        BinStats {
            unscreened: 0,
            sampled: 0,
            sum: vec![0.0; n_values],
            sum_sq: vec![0.0; n_values],
            weight,
        }
    }

    fn add(&mut self, values: &[f64]) {
        self.sampled += 1;
        for (i, &v) in values.iter().enumerate() {
            self.sum[i] += v;
            self.sum_sq[i] += v * v;
        }
    }

    fn absorb(&mut self, other: &BinStats) {
        self.unscreened += other.unscreened;
        self.sampled += other.sampled;
        for (a, b) in self.sum.iter_mut().zip(&other.sum) {
            *a += b;
        }
        for (a, b) in self.sum_sq.iter_mut().zip(&other.sum_sq) {
            *a += b;
        }
    }

    fn mean(&self, i: usize) -> f64 {
        self.sum[i] / self.sampled as f64
    }
}

/// Stratified ratio of one numerator to the denominator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioEstimate {
    pub ratio: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub numerators: Vec<f64>,
    pub denominator: f64,
    pub ratios: Vec<RatioEstimate>,
    /// Measured samples over all bins
    pub sampled: u64,
    /// Unscreened samples over all bins
    pub unscreened: u64,
    /// Variance inflation from correlation, per order; 1 without blocks
    pub inefficiency: Vec<f64>,
    /// Committed blocks
    pub blocks: u64,
}

/// Sums for the ratio of totals Σ num_k / Σ den over a set of terms.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioMoments {
    pub count: u64,
    pub num: Vec<f64>,
    pub den: f64,
    pub num_sq: Vec<f64>,
    pub num_den: Vec<f64>,
    pub den_sq: f64,
}

impl RatioMoments {
    pub fn new(n_orders: usize) -> Self {
        RatioMoments {
            count: 0,
            num: vec![0.0; n_orders],
            den: 0.0,
            num_sq: vec![0.0; n_orders],
            num_den: vec![0.0; n_orders],
            den_sq: 0.0,
        }
    }

    pub fn add(&mut self, nums: &[f64], den: f64) {
        self.count += 1;
        self.den += den;
        self.den_sq += den * den;
        for (k, &x) in nums.iter().enumerate() {
            self.num[k] += x;
            self.num_sq[k] += x * x;
            self.num_den[k] += x * den;
        }
    }

    pub fn absorb(&mut self, other: &RatioMoments) {
        self.count += other.count;
        self.den += other.den;
        self.den_sq += other.den_sq;
        for k in 0..self.num.len().min(other.num.len()) {
            self.num[k] += other.num[k];
            self.num_sq[k] += other.num_sq[k];
            self.num_den[k] += other.num_den[k];
        }
    }

    /// Variance of Σ num_k / Σ den from the scatter of the terms around the
    /// ratio, treating the terms as independent.
    pub fn ratio_variance(&self, k: usize) -> Option<f64> {
        if self.count < 2 || self.den == 0.0 {
            return None;
        }
        let r = self.num[k] / self.den;
        let e2 = self.num_sq[k] - 2.0 * r * self.num_den[k] + r * r * self.den_sq;
        let c = self.count as f64;
        let var = e2 * c / (c - 1.0) / (self.den * self.den);
        var.is_finite().then_some(var.max(0.0))
    }
}

/// A measured sample: its stored values and the weight it was drawn with.
#[derive(Debug, Clone, PartialEq)]
pub struct Measured {
    pub values: Vec<f64>,
    pub weight: f64,
}

impl Measured {
    /// Numerators and denominator divided by the weight, so that unmeasured
    /// samples can count as zeros without biasing a plain average.
    pub fn scaled(&self, n_orders: usize) -> (Vec<f64>, f64) {
        let nums = self.values[..n_orders].iter().map(|v| v / self.weight).collect();
        (nums, self.values[n_orders] / self.weight)
    }
}

/// One worker's samples since its last committed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTally {
    moments: RatioMoments,
}

impl BlockTally {
    pub fn new(n_orders: usize) -> Self {
        BlockTally {
            moments: RatioMoments::new(n_orders),
        }
    }

    /// Count one recorded sample, measured or not.
    pub fn observe(&mut self, measured: Option<&Measured>) {
        let n_orders = self.moments.num.len();
        match measured {
            Some(m) => {
                let (nums, den) = m.scaled(n_orders);
                self.moments.add(&nums, den);
            }
            None => self.moments.add(&vec![0.0; n_orders], 0.0),
        }
    }

    pub fn len(&self) -> u64 {
        self.moments.count
    }

    pub fn is_empty(&self) -> bool {
        self.moments.count == 0
    }
}

/// Sample-level and block-level moments of the committed blocks.
#[derive(Debug, Clone, PartialEq)]
struct Correlation {
    samples: RatioMoments,
    blocks: RatioMoments,
}

/// Per-bin numbers the estimators work from. `fraction` is relative to the
/// measured bins.
struct BinView {
    fraction: f64,
    sampled: f64,
    mean: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl BinView {
    /// Per-sample covariance of values a and b within the bin; `prod` is the
    /// stored product a·b when a != b.
    fn cov(&self, a: usize, b: usize, prod: Option<usize>) -> f64 {
        let second = if a == b {
            self.sum_sq[a] / self.sampled
        } else {
            prod.map_or(self.mean[a] * self.mean[b], |p| self.mean[p])
        };
        second - self.mean[a] * self.mean[b]
    }
}

pub struct BinnedAccumulator {
    n_orders: usize,
    nominal_weight: f64,
    min_weight: f64,
    bins: RwLock<BTreeMap<BinKey, Arc<Mutex<BinStats>>>>,
    total: AtomicU64,
    correlation: Mutex<Correlation>,
}

impl BinnedAccumulator {
    pub fn new(n_orders: usize, nominal_weight: f64, min_weight: f64) -> Self {
        BinnedAccumulator {
            n_orders,
            nominal_weight,
            min_weight,
            bins: RwLock::new(BTreeMap::new()),
            total: AtomicU64::new(0),
            correlation: Mutex::new(Correlation {
                samples: RatioMoments::new(n_orders),
                blocks: RatioMoments::new(n_orders),
            }),
        }
    }

    pub fn n_orders(&self) -> usize {
        self.n_orders
    }

    pub fn n_values(&self) -> usize {
        2 * self.n_orders + 1
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.bins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.read().is_empty()
    }

    fn bin(&self, key: &BinKey) -> Arc<Mutex<BinStats>> {
        if let Some(bin) = self.bins.read().get(key) {
            return bin.clone();
        }
        let mut map = self.bins.write();
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BinStats::new(self.n_values(), self.nominal_weight))))
            .clone()
    }

    /// Record one sample with precomputed values. `u` is a uniform draw in
    /// [0, 1) deciding whether the sample is measured.
    pub fn record(&self, key: &BinKey, values: &[f64], u: f64) -> bool {
        self.record_with(key, u, || values.to_vec())
    }

    /// Record one sample, running `measure` only when the bin's weight says
    /// the sample is measured. Counts and sums change together under the
    /// bin's lock.
    pub fn record_with<F>(&self, key: &BinKey, u: f64, measure: F) -> bool
    where
        F: FnOnce() -> Vec<f64>,
    {
        self.record_sample(key, u, measure).is_some()
    }

    /// As [`BinnedAccumulator::record_with`], returning the measurement and
    /// the weight it was taken with.
    pub fn record_sample<F>(&self, key: &BinKey, u: f64, measure: F) -> Option<Measured>
    where
        F: FnOnce() -> Vec<f64>,
    {
        let bin = self.bin(key);
        self.total.fetch_add(1, Ordering::Relaxed);
        let weight = bin.lock().weight;
        if u >= weight {
            bin.lock().unscreened += 1;
            return None;
        }
        let values = measure();
        debug_assert_eq!(values.len(), self.n_values());
        let mut stats = bin.lock();
        stats.unscreened += 1;
        stats.add(&values);
        Some(Measured { values, weight })
    }

    /// Fold a finished block into the correlation estimate and clear it.
    /// Empty blocks are dropped.
    pub fn commit_block(&self, tally: &mut BlockTally) {
        if tally.is_empty() {
            return;
        }
        let mut c = self.correlation.lock();
        c.samples.absorb(&tally.moments);
        c.blocks.add(&tally.moments.num, tally.moments.den);
        tally.moments = RatioMoments::new(self.n_orders);
    }

    pub fn blocks(&self) -> u64 {
        self.correlation.lock().blocks.count
    }

    /// Block ratio variance over sample ratio variance for order `k`, at
    /// least 1. Exactly 1 until two blocks are committed.
    pub fn inefficiency(&self, k: usize) -> f64 {
        let c = self.correlation.lock();
        match (c.blocks.ratio_variance(k), c.samples.ratio_variance(k)) {
            (Some(vb), Some(vs)) if vs > 0.0 => {
                let g = vb / vs;
                if g.is_finite() {
                    g.max(1.0)
                } else {
                    1.0
                }
            }
            _ => 1.0,
        }
    }

    /// Add another accumulator's counts and sums. Weights stay as they are;
    /// bins new to `self` start at the nominal weight.
    pub fn merge_from(&self, other: &BinnedAccumulator) {
        for (key, stats) in other.snapshot() {
            let bin = self.bin(&key);
            bin.lock().absorb(&stats);
        }
        self.total.fetch_add(other.total(), Ordering::Relaxed);
        let theirs = other.correlation.lock().clone();
        let mut ours = self.correlation.lock();
        ours.samples.absorb(&theirs.samples);
        ours.blocks.absorb(&theirs.blocks);
    }

    /// Seed a bin from saved statistics, keeping its current weight.
    pub fn load_stats(&self, key: &BinKey, stats: &BinStats) {
        let bin = self.bin(key);
        bin.lock().absorb(stats);
    }

    pub fn add_total(&self, count: u64) {
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_weight(&self, key: &BinKey, weight: f64) {
        self.bin(key).lock().weight = weight.clamp(self.min_weight, 1.0);
    }

    pub fn weight(&self, key: &BinKey) -> Option<f64> {
        self.bins.read().get(key).map(|b| b.lock().weight)
    }

    pub fn weights(&self) -> Vec<(BinKey, f64)> {
        self.bins
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.lock().weight))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(BinKey, BinStats)> {
        self.bins
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.lock().clone()))
            .collect()
    }

    /// Views of the measured bins, and the fraction of unscreened samples
    /// that fell in bins never measured.
    fn views(&self) -> (Vec<(BinKey, BinView, u64)>, f64) {
        let snapshot = self.snapshot();
        let all: u64 = snapshot.iter().map(|(_, s)| s.unscreened).sum();
        let measured: u64 = snapshot
            .iter()
            .filter(|(_, s)| s.sampled > 0)
            .map(|(_, s)| s.unscreened)
            .sum();
        let views = snapshot
            .into_iter()
            .filter(|(_, s)| s.sampled > 0)
            .map(|(k, s)| {
                let n_values = s.sum.len();
                let view = BinView {
                    fraction: s.unscreened as f64 / measured as f64,
                    sampled: s.sampled as f64,
                    mean: (0..n_values).map(|i| s.mean(i)).collect(),
                    sum_sq: s.sum_sq.clone(),
                };
                (k, view, s.unscreened)
            })
            .collect();
        let missing = if all == 0 {
            0.0
        } else {
            (all - measured) as f64 / all as f64
        };
        (views, missing)
    }

    fn den(&self) -> usize {
        self.n_orders
    }

    fn prod(&self, k: usize) -> usize {
        self.n_orders + 1 + k
    }

    /// Stratified estimate of every numerator/denominator ratio.
    ///
    /// Bins that received samples but no measurement keep their share: their
    /// mean is taken as the overall one, with the variance of a single draw
    /// from the measured population.
    pub fn estimate(&self) -> Estimate {
        let (views, missing) = self.views();
        let k_orders = self.n_orders;
        let den = self.den();
        let sampled: u64 = views.iter().map(|(_, v, _)| v.sampled as u64).sum();
        let unscreened: u64 = self.snapshot().iter().map(|(_, s)| s.unscreened).sum();
        let blocks = self.blocks();
        if views.is_empty() {
            let nan = RatioEstimate {
                ratio: f64::NAN,
                error: f64::NAN,
            };
            return Estimate {
                numerators: vec![f64::NAN; k_orders],
                denominator: f64::NAN,
                ratios: vec![nan; k_orders],
                sampled,
                unscreened,
                inefficiency: vec![1.0; k_orders],
                blocks,
            };
        }
        let n_total = unscreened.max(1) as f64;
        let stratified = |i: usize| -> f64 { views.iter().map(|(_, v, _)| v.fraction * v.mean[i]).sum() };
        let numerators: Vec<f64> = (0..k_orders).map(stratified).collect();
        let denominator = stratified(den);

        // covariance of the stratified means of values a and b
        let covariance = |a: usize, b: usize, ma: f64, mb: f64, prod: Option<usize>| -> f64 {
            let (mut within, mut between, mut population) = (0.0, 0.0, 0.0);
            for (_, v, _) in &views {
                let spread = (v.mean[a] - ma) * (v.mean[b] - mb);
                within += v.fraction * v.fraction * v.cov(a, b, prod) / v.sampled;
                between += v.fraction * spread / n_total;
                population += v.fraction * (v.cov(a, b, prod) + spread);
            }
            within + between + missing * missing * population
        };

        let v_dd = covariance(den, den, denominator, denominator, None);
        let inefficiency: Vec<f64> = (0..k_orders).map(|k| self.inefficiency(k)).collect();
        let ratios = (0..k_orders)
            .map(|k| {
                let mn = numerators[k];
                let r = mn / denominator;
                let v_nn = covariance(k, k, mn, mn, None);
                let v_nd = covariance(k, den, mn, denominator, Some(self.prod(k)));
                let var = (v_nn - 2.0 * r * v_nd + r * r * v_dd) / (denominator * denominator);
                RatioEstimate {
                    ratio: r,
                    error: (var.max(0.0) * inefficiency[k]).sqrt(),
                }
            })
            .collect();

        Estimate {
            numerators,
            denominator,
            ratios,
            sampled,
            unscreened,
            inefficiency,
            blocks,
        }
    }

    /// Re-derive measurement probabilities from the current statistics.
    ///
    /// For each order the per-sample deviation σ_i of the linearised ratio
    /// contribution num - r·den sets w_i = k·σ_i, with k minimising
    /// (error²) × (generation + measurement cost) at the given cost ratio.
    /// Weights clamp at 1, floor at the minimum weight, and the largest over
    /// orders wins. Bins with fewer than two measurements or zero variance
    /// keep their weight. No-op when nothing has been measured.
    pub fn recompute_weights(&self, cost_ratio: f64) {
        let (views, _) = self.views();
        if views.is_empty() {
            return;
        }
        let den = self.den();
        let mut best: BTreeMap<BinKey, f64> = BTreeMap::new();

        for order in 0..self.n_orders {
            let estimate_num: f64 = views.iter().map(|(_, v, _)| v.fraction * v.mean[order]).sum();
            let estimate_den: f64 = views.iter().map(|(_, v, _)| v.fraction * v.mean[den]).sum();
            if estimate_den == 0.0 || !estimate_den.is_finite() {
                continue;
            }
            let r = estimate_num / estimate_den;
            let prod = self.prod(order);

            // between-bin variance of the linearised contribution
            let between: f64 = views
                .iter()
                .map(|(_, v, _)| {
                    let y = v.mean[order] - r * v.mean[den];
                    v.fraction * y * y
                })
                .sum();

            let mut sigma = Vec::with_capacity(views.len());
            let mut fixed_cost = 0.0;
            for (key, v, _) in &views {
                let var = v.cov(order, order, None)
                    - 2.0 * r * v.cov(order, den, Some(prod))
                    + r * r * v.cov(den, den, None);
                if v.sampled < 2.0 || !(var > 0.0) || !var.is_finite() {
                    debug!("bin {} keeps its weight (samples {}, variance {})", key, v.sampled, var);
                    let w = self.weight(key).unwrap_or(self.nominal_weight);
                    fixed_cost += v.fraction * w;
                    sigma.push(None);
                } else {
                    sigma.push(Some(var.sqrt()));
                }
            }

            // clamp bins at weight 1 from the noisiest down, recomputing the
            // scale each time, until the next one stays below 1
            let mut order_by_sigma: Vec<usize> = (0..views.len()).filter(|&i| sigma[i].is_some()).collect();
            order_by_sigma.sort_by(|&a, &b| sigma[b].partial_cmp(&sigma[a]).unwrap_or(std::cmp::Ordering::Equal));
            let mut clamped = vec![false; views.len()];
            let (mut cost, mut var_clamped) = (fixed_cost, 0.0);
            let scale_for = |cost: f64, var_clamped: f64| {
                let denom = cost_ratio * (between + var_clamped);
                if denom > 0.0 {
                    ((1.0 + cost_ratio * cost) / denom).sqrt()
                } else {
                    f64::INFINITY
                }
            };
            let mut scale = scale_for(cost, var_clamped);
            for &i in &order_by_sigma {
                let s = sigma[i].unwrap_or(0.0);
                if scale * s < 1.0 {
                    break;
                }
                clamped[i] = true;
                cost += views[i].1.fraction;
                var_clamped += views[i].1.fraction * s * s;
                scale = scale_for(cost, var_clamped);
            }

            for (i, s) in sigma.iter().enumerate() {
                if let Some(s) = s {
                    let w = if clamped[i] {
                        1.0
                    } else {
                        (scale * s).min(1.0).max(self.min_weight)
                    };
                    let entry = best.entry(views[i].0.clone()).or_insert(0.0);
                    *entry = entry.max(w);
                }
            }
        }

        let map = self.bins.read();
        for (key, w) in best {
            if let Some(bin) = map.get(&key) {
                bin.lock().weight = w;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key(a: u32, b: u32) -> BinKey {
        BinKey(vec![a, b])
    }

    #[test]
    fn test_bin_key_text_form() {
        let k = key(3, 1);
        assert_eq!(k.to_string(), "3,1");
        assert_eq!("3,1".parse::<BinKey>().unwrap(), k);
        assert!("3,x".parse::<BinKey>().is_err());
        assert!("".parse::<BinKey>().is_err());
    }

    #[test]
    fn test_sampled_never_exceeds_unscreened() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        let mut rng = StdRng::seed_from_u64(4);
        acc.set_weight(&key(1, 0), 0.3);
        for i in 0..1000 {
            let k = key(i % 3, 0);
            acc.record(&k, &measurement_values(&[1.0], 2.0), rng.gen());
            for (_, s) in acc.snapshot() {
                assert!(s.sampled <= s.unscreened);
            }
        }
        assert_eq!(acc.total(), 1000);
        let light = acc.snapshot().into_iter().find(|(k, _)| *k == key(1, 0)).unwrap().1;
        assert!(light.sampled < light.unscreened);
    }

    #[test]
    fn test_measurement_skipped_when_not_sampled() {
        let acc = BinnedAccumulator::new(1, 0.5, 0.01);
        let k = key(0, 0);
        let mut called = false;
        assert!(!acc.record_with(&k, 0.9, || {
            called = true;
            measurement_values(&[1.0], 1.0)
        }));
        assert!(!called);
        assert!(acc.record_with(&k, 0.1, || measurement_values(&[1.0], 1.0)));
        let stats = &acc.snapshot()[0].1;
        assert_eq!((stats.unscreened, stats.sampled), (2, 1));
    }

    fn filled(seed: u64) -> BinnedAccumulator {
        // dyadic values keep every sum exact
        let acc = BinnedAccumulator::new(2, 1.0, 0.01);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..200 {
            let k = key(rng.gen_range(0..4), rng.gen_range(0..2));
            let nums = [rng.gen_range(-8..8) as f64 * 0.25, rng.gen_range(-8..8) as f64 * 0.125];
            let den = rng.gen_range(1..8) as f64 * 0.5;
            acc.record(&k, &measurement_values(&nums, den), 0.0);
        }
        acc
    }

    fn merged(parts: &[&BinnedAccumulator]) -> Vec<(BinKey, BinStats)> {
        let acc = BinnedAccumulator::new(2, 1.0, 0.01);
        for p in parts {
            acc.merge_from(p);
        }
        acc.snapshot()
    }

    #[test]
    fn test_merge_is_associative_and_commutative() {
        let (a, b, c) = (filled(1), filled(2), filled(3));
        let abc = merged(&[&a, &b, &c]);
        assert_eq!(abc, merged(&[&c, &a, &b]));
        assert_eq!(abc, merged(&[&b, &c, &a]));

        // (a + b) + c against a + (b + c)
        let ab = BinnedAccumulator::new(2, 1.0, 0.01);
        ab.merge_from(&a);
        ab.merge_from(&b);
        let left = BinnedAccumulator::new(2, 1.0, 0.01);
        left.merge_from(&ab);
        left.merge_from(&c);
        let bc = BinnedAccumulator::new(2, 1.0, 0.01);
        bc.merge_from(&b);
        bc.merge_from(&c);
        let right = BinnedAccumulator::new(2, 1.0, 0.01);
        right.merge_from(&a);
        right.merge_from(&bc);
        assert_eq!(left.snapshot(), right.snapshot());
        assert_eq!(left.total(), 600);
    }

    #[test]
    fn test_merge_leaves_weights_alone() {
        let a = filled(1);
        let b = filled(2);
        a.set_weight(&key(0, 0), 0.25);
        b.set_weight(&key(0, 0), 0.75);
        a.merge_from(&b);
        assert_eq!(a.weight(&key(0, 0)), Some(0.25));
    }

    #[test]
    fn test_single_bin_estimate() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        for (n, d) in [(1.0, 2.0), (3.0, 2.0), (2.0, 4.0), (2.0, 4.0)] {
            acc.record(&key(0, 0), &measurement_values(&[n], d), 0.0);
        }
        let est = acc.estimate();
        assert_relative_eq!(est.numerators[0], 2.0, epsilon = 1e-14);
        assert_relative_eq!(est.denominator, 3.0, epsilon = 1e-14);
        assert_relative_eq!(est.ratios[0].ratio, 2.0 / 3.0, epsilon = 1e-14);
        // var(n) = 0.5, var(d) = 1, cov(n, d) = 0 per sample; delta method
        let var: f64 = (0.5 / 4.0 + (4.0 / 9.0) * (1.0 / 4.0)) / 9.0;
        assert_relative_eq!(est.ratios[0].error, var.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_stratified_estimate_uses_unscreened_fractions() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        let heavy = key(0, 0);
        let light = key(1, 0);
        for _ in 0..30 {
            acc.record(&heavy, &measurement_values(&[1.0], 1.0), 0.0);
        }
        acc.set_weight(&light, 0.5);
        // ten samples land in the light bin, five of them measured
        for i in 0..10 {
            let u = if i % 2 == 0 { 0.0 } else { 0.9 };
            acc.record(&light, &measurement_values(&[3.0], 1.0), u);
        }
        let est = acc.estimate();
        assert_relative_eq!(est.numerators[0], 0.75 * 1.0 + 0.25 * 3.0, epsilon = 1e-14);
        assert_eq!(est.unscreened, 40);
        assert_eq!(est.sampled, 35);
    }

    fn noisy(seed: u64) -> BinnedAccumulator {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..2000 {
            let quiet = rng.gen::<f64>() < 0.8;
            let (k, n) = if quiet {
                (key(0, 0), 1.0 + 0.01 * rng.gen::<f64>())
            } else {
                (key(1, 0), 10.0 * (rng.gen::<f64>() - 0.5))
            };
            acc.record(&k, &measurement_values(&[n], 1.0), 0.0);
        }
        acc
    }

    #[test]
    fn test_recompute_weights_is_idempotent() {
        let acc = noisy(8);
        acc.recompute_weights(5.0);
        let first = acc.weights();
        acc.recompute_weights(5.0);
        assert_eq!(first, acc.weights());
    }

    #[test]
    fn test_recompute_weights_bounds_and_ordering() {
        let acc = noisy(9);
        acc.recompute_weights(5.0);
        let weights: BTreeMap<_, _> = acc.weights().into_iter().collect();
        for w in weights.values() {
            assert!(*w >= 0.01 && *w <= 1.0);
        }
        // the quiet bin needs far fewer measurements
        assert!(weights[&key(0, 0)] < weights[&key(1, 0)]);
    }

    #[test]
    fn test_recompute_weights_without_samples_is_noop() {
        let acc = BinnedAccumulator::new(1, 0.7, 0.01);
        acc.set_weight(&key(2, 2), 0.4);
        acc.recompute_weights(5.0);
        assert_eq!(acc.weight(&key(2, 2)), Some(0.4));
    }

    #[test]
    fn test_degenerate_bins_keep_weight() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        acc.set_weight(&key(0, 0), 0.6);
        acc.record(&key(0, 0), &measurement_values(&[1.0], 1.0), 0.0);
        // constant values: zero variance
        for _ in 0..5 {
            acc.record(&key(1, 0), &measurement_values(&[2.0], 1.0), 0.0);
        }
        acc.set_weight(&key(1, 0), 0.8);
        acc.recompute_weights(1.0);
        assert_eq!(acc.weight(&key(0, 0)), Some(0.6));
        assert_eq!(acc.weight(&key(1, 0)), Some(0.8));
    }

    #[test]
    fn test_clamping_starts_from_noisiest_bin() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        for i in 0..100 {
            let (wide, narrow) = if i % 2 == 0 { (11.0, 1.125) } else { (-9.0, 0.875) };
            acc.record(&key(0, 0), &measurement_values(&[wide], 1.0), 0.0);
            acc.record(&key(1, 0), &measurement_values(&[narrow], 1.0), 0.0);
        }
        acc.recompute_weights(1.0);
        // per-sample spreads 10 and 0.125; only the wide bin reaches weight 1
        assert_eq!(acc.weight(&key(0, 0)), Some(1.0));
        let expected = 0.125 * (1.5f64 / 50.0).sqrt();
        assert_relative_eq!(acc.weight(&key(1, 0)).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_unmeasured_bin_widens_error() {
        let fill = |acc: &BinnedAccumulator| {
            for i in 0..40 {
                let n = if i % 2 == 0 { 1.0 } else { 3.0 };
                acc.record(&key(0, 0), &measurement_values(&[n], 1.0), 0.0);
            }
        };
        let measured_only = BinnedAccumulator::new(1, 1.0, 0.01);
        fill(&measured_only);
        let with_gap = BinnedAccumulator::new(1, 1.0, 0.01);
        fill(&with_gap);
        with_gap.set_weight(&key(1, 0), 0.01);
        for _ in 0..20 {
            assert!(!with_gap.record(&key(1, 0), &measurement_values(&[50.0], 1.0), 0.5));
        }

        let a = measured_only.estimate();
        let b = with_gap.estimate();
        assert_relative_eq!(a.ratios[0].ratio, b.ratios[0].ratio, epsilon = 1e-14);
        assert_relative_eq!(a.ratios[0].error, (1.0f64 / 40.0).sqrt(), epsilon = 1e-12);
        // a third of the population has no measurement at all
        assert_relative_eq!(b.ratios[0].error, (1.0f64 / 40.0 + 1.0 / 9.0).sqrt(), epsilon = 1e-12);
        assert_eq!((b.unscreened, b.sampled), (60, 40));
    }

    fn blocked(block_len: usize, n_blocks: usize, sign: impl Fn(usize, usize) -> f64) -> BinnedAccumulator {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        let mut tally = BlockTally::new(1);
        for b in 0..n_blocks {
            for i in 0..block_len {
                let m = acc.record_sample(&key(0, 0), 0.0, || measurement_values(&[sign(b, i)], 1.0));
                tally.observe(m.as_ref());
            }
            acc.commit_block(&mut tally);
            assert!(tally.is_empty());
        }
        acc
    }

    #[test]
    fn test_correlated_blocks_inflate_error() {
        // every sample in a block repeats the same value
        let acc = blocked(50, 10, |b, _| if b % 2 == 0 { 1.0 } else { -1.0 });
        assert_eq!(acc.blocks(), 10);
        let g = acc.inefficiency(0);
        assert_relative_eq!(g, 499.0 / 9.0, epsilon = 1e-10);
        let est = acc.estimate();
        assert_relative_eq!(est.inefficiency[0], g);
        assert_relative_eq!(est.ratios[0].error, (g / 500.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_alternating_samples_leave_error_alone() {
        let acc = blocked(50, 10, |_, i| if i % 2 == 0 { 1.0 } else { -1.0 });
        assert_eq!(acc.inefficiency(0), 1.0);
        assert_relative_eq!(acc.estimate().ratios[0].error, (1.0f64 / 500.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_unmeasured_samples_enter_blocks_as_zeros() {
        let acc = BinnedAccumulator::new(1, 1.0, 0.01);
        acc.set_weight(&key(0, 0), 0.5);
        let mut tally = BlockTally::new(1);
        let m = acc.record_sample(&key(0, 0), 0.1, || measurement_values(&[2.0], 1.0));
        assert_eq!(m.as_ref().map(|m| m.weight), Some(0.5));
        tally.observe(m.as_ref());
        tally.observe(acc.record_sample(&key(0, 0), 0.9, || unreachable!()).as_ref());
        assert_eq!(tally.len(), 2);
        acc.commit_block(&mut tally);
        let c = acc.correlation.lock();
        assert_eq!(c.samples.count, 2);
        assert_eq!(c.samples.num, vec![4.0]);
        assert_eq!(c.blocks.den, 2.0);
    }

    #[test]
    fn test_merge_carries_block_statistics() {
        let a = blocked(50, 4, |b, _| if b % 2 == 0 { 1.0 } else { -1.0 });
        let b = blocked(50, 6, |b, _| if b % 2 == 0 { 1.0 } else { -1.0 });
        let total = BinnedAccumulator::new(1, 1.0, 0.01);
        total.merge_from(&a);
        total.merge_from(&b);
        assert_eq!(total.blocks(), 10);
        assert_relative_eq!(total.inefficiency(0), 499.0 / 9.0, epsilon = 1e-10);
    }
}
