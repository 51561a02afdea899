//! Sum over all biconnected Mayer graphs on a set of points.
//!
//! Tables are indexed by bit masks of included points. Starting from the
//! products over complete graphs (every pair contributes e = 1 + f), the
//! connected sums are peeled off by fixing the lowest point, and one
//! articulation pass per point then removes every graph in which that point
//! separates the rest. Both a scalar and a truncated-polynomial version are
//! provided; the latter keeps split square-well bonds as powers of the well
//! variable.

use crate::bond::{BondMatrix, BondValue};

/// Largest point count the bit-mask tables support.
pub const MAX_POINTS: usize = 16;

#[inline]
fn highest_bit(s: usize) -> usize {
    (usize::BITS - 1 - s.leading_zeros()) as usize
}

#[inline]
fn lowest_bit(s: usize) -> usize {
    s & s.wrapping_neg()
}

/// Calls `f` with every proper subset of `mask`, the empty set included,
/// in decreasing numeric order.
#[inline]
fn for_proper_subsets(mask: usize, mut f: impl FnMut(usize)) {
    let mut sub = mask;
    while sub != 0 {
        sub = (sub - 1) & mask;
        f(sub);
    }
}

/// Scalar biconnected sum Σ_G Π_{(i,j)∈G} f_ij.
pub fn biconnected_sum(bonds: &BondMatrix) -> f64 {
    let n = bonds.n_points();
    debug_assert!((1..=MAX_POINTS).contains(&n));
    if n == 1 {
        return 1.0;
    }
    let size = 1usize << n;
    let full = size - 1;

    let mut q = vec![1.0; size];
    for s in 1..size {
        if s.count_ones() < 2 {
            continue;
        }
        let k = highest_bit(s);
        let rest = s ^ (1 << k);
        let mut prod = q[rest];
        for j in 0..k {
            if rest & (1 << j) != 0 {
                prod *= bonds.e(k, j);
            }
        }
        q[s] = prod;
    }

    let mut conn = vec![0.0; size];
    for s in 1..size {
        if s.count_ones() == 1 {
            conn[s] = 1.0;
            continue;
        }
        let low = lowest_bit(s);
        let rest = s ^ low;
        let mut acc = 0.0;
        for_proper_subsets(rest, |sub| {
            let t = low | sub;
            acc += conn[t] * q[s ^ t];
        });
        conn[s] = q[s] - acc;
    }

    let mut old = conn;
    let mut new = old.clone();
    for v in 0..n {
        let bv = 1 << v;
        for s in 1..size {
            if s & bv == 0 || s.count_ones() < 3 {
                continue;
            }
            let rest = s ^ bv;
            let low = lowest_bit(rest);
            let rr = rest ^ low;
            let mut acc = 0.0;
            for_proper_subsets(rr, |sub| {
                let t = low | sub;
                acc += new[t | bv] * old[s ^ t];
            });
            new[s] = old[s] - acc;
        }
        old.copy_from_slice(&new);
    }
    old[full]
}

/// Flat table of truncated polynomials, one row of `orders` coefficients
/// per subset.
struct PolyTable {
    orders: usize,
    data: Vec<f64>,
}

impl PolyTable {
    fn new(size: usize, orders: usize) -> Self {
        PolyTable {
            orders,
            data: vec![0.0; size * orders],
        }
    }

    fn row(&self, s: usize) -> &[f64] {
        &self.data[s * self.orders..(s + 1) * self.orders]
    }

    fn row_mut(&mut self, s: usize) -> &mut [f64] {
        let k = self.orders;
        &mut self.data[s * k..(s + 1) * k]
    }

    fn set_one(&mut self, s: usize) {
        let row = self.row_mut(s);
        row.fill(0.0);
        row[0] = 1.0;
    }
}

/// acc += a * b, truncated to `acc.len()` orders.
fn mul_add(acc: &mut [f64], a: &[f64], b: &[f64]) {
    let k = acc.len();
    for (i, &ai) in a.iter().enumerate() {
        if ai == 0.0 {
            continue;
        }
        for (j, &bj) in b.iter().take(k - i).enumerate() {
            acc[i + j] += ai * bj;
        }
    }
}

/// p *= (1 + bond) in place.
fn mul_linear(p: &mut [f64], bond: BondValue) {
    let c = 1.0 + bond.constant;
    let l = bond.linear;
    for d in (0..p.len()).rev() {
        let lower = if d > 0 { p[d - 1] } else { 0.0 };
        p[d] = c * p[d] + l * lower;
    }
}

/// Biconnected sum with every bond taken as `constant + linear * x`.
///
/// Returns the first `orders` coefficients of the polynomial in x.
pub fn biconnected_polynomial(bonds: &BondMatrix, orders: usize) -> Vec<f64> {
    let n = bonds.n_points();
    debug_assert!((1..=MAX_POINTS).contains(&n));
    let mut result = vec![0.0; orders.max(1)];
    if n == 1 {
        result[0] = 1.0;
        return result;
    }
    let orders = result.len();
    let size = 1usize << n;
    let full = size - 1;

    let mut q = PolyTable::new(size, orders);
    q.set_one(0);
    for s in 1..size {
        if s.count_ones() < 2 {
            q.set_one(s);
            continue;
        }
        let k = highest_bit(s);
        let rest = s ^ (1 << k);
        let mut prod = q.row(rest).to_vec();
        for j in 0..k {
            if rest & (1 << j) != 0 {
                mul_linear(&mut prod, bonds.bond(k, j));
            }
        }
        q.row_mut(s).copy_from_slice(&prod);
    }

    let mut conn = PolyTable::new(size, orders);
    let mut acc = vec![0.0; orders];
    for s in 1..size {
        if s.count_ones() == 1 {
            conn.set_one(s);
            continue;
        }
        let low = lowest_bit(s);
        let rest = s ^ low;
        acc.fill(0.0);
        for_proper_subsets(rest, |sub| {
            let t = low | sub;
            mul_add(&mut acc, conn.row(t), q.row(s ^ t));
        });
        for (c, (&qs, &a)) in conn.row_mut(s).iter_mut().zip(q.row(s).iter().zip(&acc)) {
            *c = qs - a;
        }
    }

    let mut old = conn;
    let mut new = PolyTable {
        orders,
        data: old.data.clone(),
    };
    for v in 0..n {
        let bv = 1 << v;
        for s in 1..size {
            if s & bv == 0 || s.count_ones() < 3 {
                continue;
            }
            let rest = s ^ bv;
            let low = lowest_bit(rest);
            let rr = rest ^ low;
            acc.fill(0.0);
            for_proper_subsets(rr, |sub| {
                let t = low | sub;
                mul_add(&mut acc, new.row(t | bv), old.row(s ^ t));
            });
            let base = old.row(s).to_vec();
            for (x, (b, a)) in new.row_mut(s).iter_mut().zip(base.iter().zip(&acc)) {
                *x = b - a;
            }
        }
        old.data.copy_from_slice(&new.data);
    }
    result.copy_from_slice(old.row(full));
    result
}

/// Whether the graph given by adjacency masks is connected on `mask`.
pub fn is_connected(adj: &[u32], mask: u32) -> bool {
    if mask == 0 {
        return true;
    }
    let start = mask & mask.wrapping_neg();
    let mut seen = start;
    let mut frontier = start;
    while frontier != 0 {
        let v = frontier.trailing_zeros() as usize;
        frontier &= frontier - 1;
        let next = adj[v] & mask & !seen;
        seen |= next;
        frontier |= next;
    }
    seen == mask
}

/// Whether the graph on all `adj.len()` points stays connected after removing
/// any single point. Two points count as biconnected when they are bonded.
pub fn is_biconnected(adj: &[u32]) -> bool {
    let n = adj.len();
    let full: u32 = if n >= 32 { u32::MAX } else { (1u32 << n) - 1 };
    match n {
        0 | 1 => true,
        2 => adj[0] & 2 != 0,
        _ => is_connected(adj, full) && (0..n).all(|v| is_connected(adj, full & !(1 << v))),
    }
}
