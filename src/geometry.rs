use nalgebra::Vector3;

/// Ordered point positions of one cluster configuration.
///
/// Point 0 is the anchor: cluster integrals are taken over the remaining
/// N-1 positions relative to it, so moves never displace it. An optional
/// periodic box applies the minimum-image convention to separations.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    positions: Vec<Vector3<f64>>,
    box_lengths: Option<Vector3<f64>>,
}

impl Configuration {
    pub fn new(positions: Vec<Vector3<f64>>) -> Self {
        Configuration {
            positions,
            box_lengths: None,
        }
    }

    pub fn with_box(mut self, box_lengths: Vector3<f64>) -> Self {
        self.box_lengths = Some(box_lengths);
        self
    }

    /// Regular polygon of radius `radius` in the xy plane with point 0 at
    /// the origin. Every pair separation is at most `2 * radius`.
    pub fn seed_layout(n: usize, radius: f64) -> Self {
        let mut positions = Vec::with_capacity(n);
        if n > 0 {
            let center = Vector3::new(-radius, 0.0, 0.0);
            for i in 0..n {
                let phi = std::f64::consts::TAU * i as f64 / n as f64;
                positions.push(center + Vector3::new(radius * phi.cos(), radius * phi.sin(), 0.0));
            }
        }
        Configuration::new(positions)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vector3<f64>] {
        &self.positions
    }

    pub fn position(&self, i: usize) -> Vector3<f64> {
        self.positions[i]
    }

    pub fn set_position(&mut self, i: usize, pos: Vector3<f64>) {
        self.positions[i] = pos;
    }

    // Apply minimum-image convention
    pub fn minimum_image(&self, mut d: Vector3<f64>) -> Vector3<f64> {
        if let Some(lengths) = self.box_lengths {
            for k in 0..3 {
                let l = lengths[k];
                d[k] -= l * (d[k] / l).round();
            }
        }
        d
    }

    pub fn separation(&self, i: usize, j: usize) -> Vector3<f64> {
        self.minimum_image(self.positions[j] - self.positions[i])
    }

    pub fn distance2(&self, i: usize, j: usize) -> f64 {
        self.separation(i, j).norm_squared()
    }

    /// Squared distance from an arbitrary point to point `j`.
    pub fn distance2_to(&self, p: &Vector3<f64>, j: usize) -> f64 {
        self.minimum_image(self.positions[j] - p).norm_squared()
    }

    /// Bit-level equality of all coordinates.
    pub fn bitwise_eq(&self, other: &Configuration) -> bool {
        self.positions.len() == other.positions.len()
            && self
                .positions
                .iter()
                .zip(&other.positions)
                .all(|(a, b)| a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_seed_layout_is_compact() {
        let cfg = Configuration::seed_layout(5, 0.3);
        assert_eq!(cfg.len(), 5);
        assert_eq!(cfg.position(0), Vector3::zeros());
        for i in 0..5 {
            for j in (i + 1)..5 {
                assert!(cfg.distance2(i, j) <= 0.36 + 1e-12);
            }
        }
    }

    #[test]
    fn test_minimum_image() {
        let cfg = Configuration::new(vec![
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(9.5, 0.0, 0.0),
        ])
        .with_box(Vector3::new(10.0, 10.0, 10.0));
        assert_relative_eq!(cfg.distance2(0, 1), 1.0, epsilon = 1e-12);
    }
}
