use nalgebra::DMatrix;

/// Workspace for the per-point angular factors of an expansion: associated
/// Legendre values (and derivatives) indexed by `(l, m)`, plus the
/// `cos(mφ)` / `sin(mφ)` recursion vectors. One instance per worker thread.
pub struct AngularTables {
    pub legs: DMatrix<f64>,
    pub dlegs: DMatrix<f64>,
    pub cosm: Vec<f64>,
    pub sinm: Vec<f64>,
}

impl AngularTables {
    pub fn new(lmax: usize) -> Self {
        Self {
            legs: DMatrix::zeros(lmax + 1, lmax + 1),
            dlegs: DMatrix::zeros(lmax + 1, lmax + 1),
            cosm: vec![0.0; lmax + 1],
            sinm: vec![0.0; lmax + 1],
        }
    }
}

/// Associated Legendre polynomials P_l^m(x) for all `l ≤ lmax`, `m ≤ l`,
/// by the standard stable recurrence (Condon–Shortley phase included).
pub fn legendre(lmax: usize, x: f64, p: &mut DMatrix<f64>) {
    let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
    let mut pll = 1.0;
    let mut fact = 1.0;
    for m in 0..=lmax {
        p[(m, m)] = pll;
        if m < lmax {
            p[(m + 1, m)] = x * (2 * m + 1) as f64 * pll;
        }
        pll *= -fact * somx2;
        fact += 2.0;
    }
    for m in 0..=lmax {
        for l in m + 2..=lmax {
            p[(l, m)] = (x * (2 * l - 1) as f64 * p[(l - 1, m)]
                - (l + m - 1) as f64 * p[(l - 2, m)])
                / (l - m) as f64;
        }
    }
}

/// Legendre values and their θ-derivatives dP_l^m/dx. The grid point is
/// pulled off |x| = 1 by a small offset to keep the derivative finite.
pub fn legendre_with_derivative(
    lmax: usize,
    x: f64,
    p: &mut DMatrix<f64>,
    dp: &mut DMatrix<f64>,
) {
    const TOL: f64 = 1.0e-12;
    let x = x.clamp(-1.0 + TOL, 1.0 - TOL);
    legendre(lmax, x, p);
    let somx2 = 1.0 / ((x - 1.0) * (x + 1.0));
    dp[(0, 0)] = 0.0;
    for l in 1..=lmax {
        for m in 0..l {
            dp[(l, m)] = somx2
                * (x * l as f64 * p[(l, m)] - (l + m) as f64 * p[(l - 1, m)]);
        }
        dp[(l, l)] = somx2 * x * l as f64 * p[(l, l)];
    }
}

/// cos(mφ) and sin(mφ) for all `m ≤ mmax` by the addition recurrence.
pub fn sine_cosine(mmax: usize, phi: f64, c: &mut [f64], s: &mut [f64]) {
    c[0] = 1.0;
    s[0] = 0.0;
    if mmax > 0 {
        c[1] = phi.cos();
        s[1] = phi.sin();
        for m in 2..=mmax {
            c[m] = 2.0 * c[1] * c[m - 1] - c[m - 2];
            s[m] = 2.0 * c[1] * s[m - 1] - s[m - 2];
        }
    }
}

/// (l−m)!/(l+m)!, evaluated through log-gamma to stay finite at high l.
pub fn factorial_ratio(l: usize, m: usize) -> f64 {
    (ln_gamma((l - m + 1) as f64) - ln_gamma((l + m + 1) as f64)).exp()
}

/// Lanczos approximation of ln Γ(x) for x > 0.
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::*;
    use crate::test_utils::assert_close;

    #[test]
    fn legendre_low_orders() {
        let mut p = DMatrix::zeros(3, 3);
        let x = 0.4;
        legendre(2, x, &mut p);
        assert_close(p[(0, 0)], 1.0, 1e-14);
        assert_close(p[(1, 0)], x, 1e-14);
        assert_close(p[(1, 1)], -(1.0 - x * x).sqrt(), 1e-14);
        assert_close(p[(2, 0)], 0.5 * (3.0 * x * x - 1.0), 1e-14);
        assert_close(p[(2, 2)], 3.0 * (1.0 - x * x), 1e-14);
    }

    #[test]
    fn legendre_derivative_matches_finite_difference() {
        let lmax = 4;
        let mut p = DMatrix::zeros(lmax + 1, lmax + 1);
        let mut dp = DMatrix::zeros(lmax + 1, lmax + 1);
        let mut plus = DMatrix::zeros(lmax + 1, lmax + 1);
        let mut minus = DMatrix::zeros(lmax + 1, lmax + 1);
        let x = 0.3;
        let h = 1e-6;
        legendre_with_derivative(lmax, x, &mut p, &mut dp);
        legendre(lmax, x + h, &mut plus);
        legendre(lmax, x - h, &mut minus);
        for l in 0..=lmax {
            for m in 0..=l {
                let fd = (plus[(l, m)] - minus[(l, m)]) / (2.0 * h);
                assert_close(dp[(l, m)], fd, 1e-4 * (1.0 + fd.abs()));
            }
        }
    }

    #[test]
    fn sine_cosine_recursion() {
        let mmax = 6;
        let phi = 1.17;
        let mut c = vec![0.0; mmax + 1];
        let mut s = vec![0.0; mmax + 1];
        sine_cosine(mmax, phi, &mut c, &mut s);
        for m in 0..=mmax {
            assert_close(c[m], (m as f64 * phi).cos(), 1e-12);
            assert_close(s[m], (m as f64 * phi).sin(), 1e-12);
        }
    }

    #[test]
    fn factorial_ratio_small_values() {
        // (2-1)!/(2+1)! = 1/6
        assert_close(factorial_ratio(2, 1), 1.0 / 6.0, 1e-12);
        // (3-3)!/(3+3)! = 1/720
        assert_close(factorial_ratio(3, 3), 1.0 / 720.0, 1e-12);
    }
}
