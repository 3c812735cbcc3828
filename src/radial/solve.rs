use nalgebra::DMatrix;
use nalgebra::DVector;

use super::map::CoordMap;

/// One radial eigenfunction: samples of the potential on the ξ grid and
/// the Sturm–Liouville eigenvalue (which is also the biorthogonal
/// normalization constant).
pub struct Eigenfunction {
    pub lambda: f64,
    pub values: Vec<f64>,
}

/// Discretize and diagonalize the radial Sturm–Liouville operator for one
/// harmonic order `l` on the mapped grid.
///
/// In the mapped coordinate the operator reads
///   −(p u')' + q u = λ ŵ u,   p = r²/J,  q = l(l+1) J,  ŵ = w r² J,
/// with the regularity condition u' = (l/r) u at the inner edge and the
/// exterior matching condition u' = −(l+1)/r u at the outer edge. A
/// finite-volume discretization keeps the matrix symmetric, so the
/// generalized problem reduces to a standard symmetric one in y = B^½ u.
/// Eigenvectors come back normalized to ∫ u_n u_m w r² dr = δ_nm on the
/// grid, with the first non-zero sample positive.
pub fn solve_radial_eigenproblem(
    l: usize,
    nmax: usize,
    xi_min: f64,
    dxi: f64,
    numr: usize,
    map: CoordMap,
    scale: f64,
    weight: impl Fn(f64) -> f64,
) -> Vec<Eigenfunction> {
    let npts = numr + 1;
    let h = dxi;
    let xi = |i: usize| xi_min + h * i as f64;
    let r_of = |x: f64| map.xi_to_r(x, scale);
    let jac = |x: f64| map.jacobian(x, scale);
    let p = |x: f64| {
        let r = r_of(x);
        r * r / jac(x)
    };
    let ll1 = (l * (l + 1)) as f64;

    let mut a = DMatrix::zeros(npts, npts);
    let mut b = DVector::zeros(npts);

    for i in 1..numr {
        let x = xi(i);
        let p_lo = p(x - 0.5 * h);
        let p_hi = p(x + 0.5 * h);
        a[(i, i)] = (p_lo + p_hi) / h + ll1 * jac(x) * h;
        a[(i, i - 1)] = -p_lo / h;
        a[(i - 1, i)] = -p_lo / h;
        let r = r_of(x);
        b[i] = weight(r) * r * r * jac(x) * h;
    }
    // Half cells at the edges carry the Robin boundary fluxes.
    {
        let x = xi(0);
        let r = r_of(x);
        a[(0, 0)] = p(x + 0.5 * h) / h + p(x) * jac(x) * l as f64 / r + ll1 * jac(x) * 0.5 * h;
        let p_hi = p(x + 0.5 * h);
        a[(0, 1)] = -p_hi / h;
        a[(1, 0)] = -p_hi / h;
        b[0] = weight(r) * r * r * jac(x) * 0.5 * h;
    }
    {
        let x = xi(numr);
        let r = r_of(x);
        let p_lo = p(x - 0.5 * h);
        a[(numr, numr)] =
            p_lo / h + p(x) * jac(x) * (l + 1) as f64 / r + ll1 * jac(x) * 0.5 * h;
        a[(numr, numr - 1)] = -p_lo / h;
        a[(numr - 1, numr)] = -p_lo / h;
        b[numr] = weight(r) * r * r * jac(x) * 0.5 * h;
    }

    // Symmetrize the generalized problem: C = B^{-1/2} A B^{-1/2}.
    let b_isqrt: DVector<f64> = b.map(|v| 1.0 / v.sqrt());
    for i in 0..npts {
        for j in 0..npts {
            a[(i, j)] *= b_isqrt[i] * b_isqrt[j];
        }
    }

    let eigen = a.symmetric_eigen();
    let mut order: Vec<usize> = (0..npts).collect();
    order.sort_by(|&i, &j| {
        eigen.eigenvalues[i]
            .partial_cmp(&eigen.eigenvalues[j])
            .unwrap()
    });

    order
        .into_iter()
        .take(nmax)
        .map(|k| {
            let lambda = eigen.eigenvalues[k];
            let column = eigen.eigenvectors.column(k);
            let mut values: Vec<f64> = (0..npts).map(|i| column[i] * b_isqrt[i]).collect();
            // y is unit-norm, so u already satisfies uᵀ B u = 1; only the
            // sign convention remains.
            let first = values.iter().find(|v| v.abs() > 1.0e-12);
            if let Some(first) = first {
                if *first < 0.0 {
                    for v in values.iter_mut() {
                        *v = -*v;
                    }
                }
            }
            Eigenfunction { lambda, values }
        })
        .collect()
}
