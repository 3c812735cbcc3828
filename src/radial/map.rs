use serde::Deserialize;
use serde::Serialize;

/// Radial coordinate map used for table storage. `Rational` compactifies
/// `[0, ∞)` onto `[-1, 1)` so a uniform table grid concentrates points at
/// small radii.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordMap {
    Identity,
    #[default]
    Rational,
    /// ξ = ln(r/scale), for tables spanning many decades in radius.
    Log,
}

impl CoordMap {
    pub fn from_flag(cmap: i32) -> Self {
        match cmap {
            0 => CoordMap::Identity,
            2 => CoordMap::Log,
            _ => CoordMap::Rational,
        }
    }

    pub fn to_flag(self) -> i32 {
        match self {
            CoordMap::Identity => 0,
            CoordMap::Rational => 1,
            CoordMap::Log => 2,
        }
    }

    pub fn r_to_xi(self, r: f64, scale: f64) -> f64 {
        match self {
            CoordMap::Identity => r,
            CoordMap::Rational => (r / scale - 1.0) / (r / scale + 1.0),
            CoordMap::Log => (r / scale).ln(),
        }
    }

    pub fn xi_to_r(self, xi: f64, scale: f64) -> f64 {
        match self {
            CoordMap::Identity => xi,
            CoordMap::Rational => scale * (1.0 + xi) / (1.0 - xi),
            CoordMap::Log => scale * xi.exp(),
        }
    }

    /// dr/dξ
    pub fn jacobian(self, xi: f64, scale: f64) -> f64 {
        match self {
            CoordMap::Identity => 1.0,
            CoordMap::Rational => 2.0 * scale / ((1.0 - xi) * (1.0 - xi)),
            CoordMap::Log => scale * xi.exp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CoordMap;
    use crate::test_utils::assert_close;

    #[test]
    fn rational_map_round_trips() {
        let map = CoordMap::Rational;
        let scale = 0.7;
        for r in [0.01, 0.5, 1.0, 3.0, 42.0] {
            let xi = map.r_to_xi(r, scale);
            assert!((-1.0..1.0).contains(&xi));
            assert_close(map.xi_to_r(xi, scale), r, 1e-12 * r.max(1.0));
        }
    }

    #[test]
    fn log_map_round_trips() {
        let map = CoordMap::Log;
        let scale = 2.0;
        for r in [0.001, 0.5, 7.0] {
            assert_close(map.xi_to_r(map.r_to_xi(r, scale), scale), r, 1e-12 * r.max(1.0));
        }
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let map = CoordMap::Rational;
        let scale = 1.3;
        let xi = 0.25;
        let h = 1e-7;
        let fd = (map.xi_to_r(xi + h, scale) - map.xi_to_r(xi - h, scale)) / (2.0 * h);
        assert_close(map.jacobian(xi, scale), fd, 1e-5);
    }
}
