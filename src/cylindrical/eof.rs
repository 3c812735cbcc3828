use log::debug;
use log::info;
use nalgebra::DMatrix;

use super::tables::CylGrid;
use super::tables::EofTables;
use super::tables::FieldTables;
use super::CylindricalParameters;
use crate::communication::BroadcastCommunicator;
use crate::communication::Communicator;
use crate::communication::SizedCommunicator;
use crate::communication::SumCommunicator;
use crate::communication::WorldCommunicator;
use crate::math::factorial_ratio;
use crate::math::legendre;
use crate::math::legendre_with_derivative;
use crate::math::sine_cosine;
use crate::math::AngularTables;
use crate::math::GaussLegendre;
use crate::radial::Field;
use crate::radial::RadialBasis;

/// One table-fill work unit: an azimuthal order and parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Task {
    m: usize,
    sine: bool,
}

fn task_list(mmax: usize) -> Vec<Task> {
    let cos = (0..=mmax).map(|m| Task { m, sine: false });
    let sin = (1..=mmax).map(|m| Task { m, sine: true });
    cos.chain(sin).collect()
}

/// Build the empirical orthogonal basis conditioned on the target
/// density.
///
/// Every rank integrates its stride of the quadrature knots into the
/// per-`m` overlap matrices, which are then all-reduced in packed
/// upper-triangular form. The master assigns one `(m, parity)` request
/// per worker round-robin; each worker diagonalizes its overlap block,
/// evaluates the leading `norder` eigenfunctions on the `(R, z)` grid
/// and ships the tables back. The master broadcasts the assembled basis.
///
/// Returns the tables and the total deprojected target mass.
pub fn build_eof(
    params: &CylindricalParameters,
    grid: &CylGrid,
    radial: &RadialBasis,
    comm_f: &mut Communicator<f64>,
    comm_ctl: &mut Communicator<i64>,
) -> (EofTables, f64) {
    let rank = comm_f.rank();
    let size = comm_f.size();
    let lmax = params.lmax;
    let nmax = params.nmax;
    let mmax = params.mmax;

    // Quadrature: Legendre in ξ(r) and cos θ, uniform in φ.
    let quad_r = GaussLegendre::new(params.eof_numr);
    let quad_t = GaussLegendre::new(params.eof_numt);
    let nump = params.eof_nump;
    let dphi = 2.0 * std::f64::consts::PI / nump as f64;

    let xi_min = params.cmap.r_to_xi(params.rmin * params.ascale, params.ascale);
    let xi_max = params
        .cmap
        .r_to_xi(grid.rtable * params.ascale, params.ascale);

    let rank2 = |m: usize| nmax * (lmax - m + 1);
    let mut overlap_cos: Vec<DMatrix<f64>> =
        (0..=mmax).map(|m| DMatrix::zeros(rank2(m), rank2(m))).collect();
    let mut overlap_sin: Vec<DMatrix<f64>> =
        (1..=mmax).map(|m| DMatrix::zeros(rank2(m), rank2(m))).collect();
    let mut cylmass = 0.0;

    let mut angular = AngularTables::new(lmax.max(mmax));
    let mut potd = DMatrix::zeros(lmax + 1, nmax);
    // Scratch: normalized basis factors per (l − m, j) for cos and sin.
    let mut fac_c = DMatrix::zeros(lmax + 1, nmax);
    let mut fac_s = DMatrix::zeros(lmax + 1, nmax);

    let mut knot = 0usize;
    for qr in 0..quad_r.len() {
        let xi = xi_min + (xi_max - xi_min) * quad_r.knots[qr];
        let rr = params.cmap.xi_to_r(xi, params.ascale);
        for qt in 0..quad_t.len() {
            // Each rank owns a stride of the (r, θ) knots.
            let mine = knot % size == rank as usize;
            knot += 1;
            if !mine {
                continue;
            }
            let costh = -1.0 + 2.0 * quad_t.knots[qt];
            let big_r = rr * (1.0 - costh * costh).max(0.0).sqrt();
            let z = rr * costh;
            legendre(lmax, costh, &mut angular.legs);
            radial.fill(rr, Field::Potential, &mut potd);

            // dV = r² dr dcosθ dφ = r² J dξ dcosθ dφ, with the Legendre
            // weights mapping their unit intervals onto [ξmin, ξmax] and
            // [−1, 1].
            let jfac = dphi
                * 2.0
                * quad_t.weights[qt]
                * (xi_max - xi_min)
                * quad_r.weights[qr]
                * rr
                * rr
                * params.cmap.jacobian(xi, params.ascale);

            for qp in 0..nump {
                let phi = dphi * qp as f64;
                sine_cosine(mmax.max(lmax), phi, &mut angular.cosm, &mut angular.sinm);

                cylmass +=
                    params.model.density(big_r, z, phi, 0, params.ascale, params.hscale) * jfac;

                for m in 0..=mmax {
                    let dens = params
                        .model
                        .density(big_r, z, phi, m, params.ascale, params.hscale)
                        * jfac;
                    if dens == 0.0 {
                        continue;
                    }
                    for l in m..=lmax {
                        let ylm = ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI)).sqrt()
                            * factorial_ratio(l, m).sqrt()
                            * angular.legs[(l, m)];
                        for j in 0..nmax {
                            let scaled = potd[(l, j)]
                                * (4.0 * std::f64::consts::PI / radial.norm(l, j)).sqrt();
                            fac_c[(l - m, j)] = ylm * scaled * angular.cosm[m];
                            if m > 0 {
                                fac_s[(l - m, j)] = ylm * scaled * angular.sinm[m];
                            }
                        }
                    }
                    let dim = rank2(m);
                    let sc = &mut overlap_cos[m];
                    for a in 0..dim {
                        let (la, ja) = (a / nmax, a % nmax);
                        let ca = fac_c[(la, ja)];
                        for b in a..dim {
                            let (lb, jb) = (b / nmax, b % nmax);
                            sc[(a, b)] += ca * fac_c[(lb, jb)] * dens;
                        }
                    }
                    if m > 0 {
                        let ss = &mut overlap_sin[m - 1];
                        for a in 0..dim {
                            let (la, ja) = (a / nmax, a % nmax);
                            let sa = fac_s[(la, ja)];
                            for b in a..dim {
                                let (lb, jb) = (b / nmax, b % nmax);
                                ss[(a, b)] += sa * fac_s[(lb, jb)] * dens;
                            }
                        }
                    }
                }
            }
        }
    }

    // All ranks need every overlap block; reduce the packed upper
    // triangles.
    for m in 0..=mmax {
        reduce_upper(&mut overlap_cos[m], comm_f);
    }
    for m in 1..=mmax {
        reduce_upper(&mut overlap_sin[m - 1], comm_f);
    }
    cylmass = comm_f.collective_sum(&cylmass);

    let tasks = task_list(mmax);
    let with_dens = params.dens;
    let mut tables = EofTables::zeros(mmax, params.norder, grid.points(), with_dens);

    let overlap_for = |task: &Task| -> &DMatrix<f64> {
        if task.sine {
            &overlap_sin[task.m - 1]
        } else {
            &overlap_cos[task.m]
        }
    };

    if size == 1 {
        for task in &tasks {
            let block = compute_eof_tables(task, overlap_for(task), params, grid, radial);
            tables.set(task.m, task.sine, block);
        }
    } else if rank == 0 {
        // Round-robin assignment over workers 1..size.
        let workers = size - 1;
        for (t, _task) in tasks.iter().enumerate() {
            let worker = (1 + t % workers) as i32;
            comm_ctl.send_vec(worker, vec![t as i64]);
        }
        for worker in 1..size as i32 {
            comm_ctl.send_vec(worker, vec![-1]);
        }
        for (t, task) in tasks.iter().enumerate() {
            let worker = (1 + t % workers) as i32;
            let flat = comm_f.receive_vec(worker);
            tables.set(task.m, task.sine, unflatten(flat, params.norder, grid.points(), with_dens));
            debug!("received EOF tables for m={} sine={}", task.m, task.sine);
        }
    } else {
        loop {
            let request = comm_ctl.receive_vec(0);
            assert_eq!(request.len(), 1);
            if request[0] < 0 {
                break;
            }
            let task = tasks[request[0] as usize];
            let block = compute_eof_tables(&task, overlap_for(&task), params, grid, radial);
            comm_f.send_vec(0, flatten(&block));
        }
    }

    broadcast_tables(&mut tables, comm_f);

    if rank == 0 {
        info!(
            "EOF basis ready: mmax={} norder={} grid {}x{}, deprojected mass {:.6e}",
            mmax, params.norder, params.numx, params.numy, cylmass
        );
    }
    (tables, cylmass)
}

fn reduce_upper(matrix: &mut DMatrix<f64>, comm: &mut Communicator<f64>) {
    let dim = matrix.nrows();
    let mut packed = Vec::with_capacity(dim * (dim + 1) / 2);
    for a in 0..dim {
        for b in a..dim {
            packed.push(matrix[(a, b)]);
        }
    }
    comm.collective_sum_slice(&mut packed);
    let mut it = packed.into_iter();
    for a in 0..dim {
        for b in a..dim {
            let v = it.next().unwrap();
            matrix[(a, b)] = v;
            matrix[(b, a)] = v;
        }
    }
}

/// Diagonalize one overlap block and tabulate its leading eigenfunctions.
fn compute_eof_tables(
    task: &Task,
    overlap: &DMatrix<f64>,
    params: &CylindricalParameters,
    grid: &CylGrid,
    radial: &RadialBasis,
) -> Vec<FieldTables> {
    let m = task.m;
    let lmax = params.lmax;
    let nmax = params.nmax;
    let dim = overlap.nrows();

    // Scale by the largest element before diagonalizing; the
    // eigenvectors are unchanged and the eigensolver sees O(1) entries.
    let max_v = overlap.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let scaled = if max_v > 1.0e-5 {
        overlap / max_v
    } else {
        overlap.clone()
    };
    let eigen = scaled.symmetric_eigen();
    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_by(|&i, &j| eigen.eigenvalues[j].partial_cmp(&eigen.eigenvalues[i]).unwrap());

    let norder = params.norder.min(dim);
    let mut vectors: Vec<Vec<f64>> = order
        .into_iter()
        .take(norder)
        .map(|k| (0..dim).map(|i| eigen.eigenvectors[(i, k)]).collect())
        .collect();
    // Sign convention: first non-zero component positive, so a rebuilt
    // basis matches its cached image bit for bit.
    for vector in vectors.iter_mut() {
        if let Some(first) = vector.iter().find(|v| v.abs() > 1.0e-12) {
            if *first < 0.0 {
                vector.iter_mut().for_each(|v| *v = -*v);
            }
        }
    }

    let mut out = vec![FieldTables::zeros(grid.points(), params.dens); params.norder];
    let mut angular = AngularTables::new(lmax);
    let mut potd = DMatrix::zeros(lmax + 1, nmax);
    let mut dpot = DMatrix::zeros(lmax + 1, nmax);
    let mut dend = DMatrix::zeros(lmax + 1, nmax);

    for ix in 0..=grid.numx {
        let big_r = grid.r_at(ix);
        for iy in 0..=grid.numy {
            let z = grid.z_at(iy);
            let rr = (big_r * big_r + z * z).sqrt() + 1.0e-18;
            let point = ix * (grid.numy + 1) + iy;

            radial.fill(rr, Field::Potential, &mut potd);
            radial.fill(rr, Field::Force, &mut dpot);
            if params.dens {
                radial.fill(rr, Field::Density, &mut dend);
            }
            let costh = z / rr;
            legendre_with_derivative(lmax, costh, &mut angular.legs, &mut angular.dlegs);

            for (k, vector) in vectors.iter().enumerate() {
                let mut potl = 0.0;
                let mut potr = 0.0;
                let mut pott = 0.0;
                let mut dens = 0.0;
                for l in m..=lmax {
                    let mut fac1 = ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI)).sqrt()
                        * factorial_ratio(l, m).sqrt();
                    if m > 0 {
                        fac1 *= std::f64::consts::SQRT_2;
                    }
                    let ylm = fac1 * angular.legs[(l, m)];
                    let dylm = fac1 * angular.dlegs[(l, m)];
                    for j in 0..nmax {
                        let s = (4.0 * std::f64::consts::PI / radial.norm(l, j)).sqrt();
                        let e = vector[(l - m) * nmax + j];
                        potl += e * ylm * potd[(l, j)] * s;
                        potr += e * ylm * dpot[(l, j)] * s;
                        pott += e * dylm * potd[(l, j)] * s;
                        if params.dens {
                            dens += -e * ylm * dend[(l, j)] * s;
                        }
                    }
                }
                out[k].pot[point] = potl;
                // Chain rule onto cylindrical coordinates:
                // ∂/∂R = (R/rr) ∂/∂rr − (zR/rr³) ∂/∂cosθ and
                // ∂/∂z = (z/rr) ∂/∂rr + (R²/rr³) ∂/∂cosθ; tables hold the
                // force (minus gradient).
                out[k].rforce[point] =
                    -(potr * big_r / rr - pott * z * big_r / (rr * rr * rr));
                out[k].zforce[point] =
                    -(potr * z / rr + pott * big_r * big_r / (rr * rr * rr));
                if params.dens {
                    out[k].dens[point] = dens;
                }
            }
        }
    }
    out
}

fn flatten(block: &[FieldTables]) -> Vec<f64> {
    let mut flat = vec![];
    for tables in block {
        for field in tables.as_blocks() {
            flat.extend_from_slice(field);
        }
    }
    flat
}

fn unflatten(flat: Vec<f64>, norder: usize, points: usize, with_dens: bool) -> Vec<FieldTables> {
    let nfields = FieldTables::num_fields(with_dens);
    assert_eq!(flat.len(), norder * nfields * points);
    let mut out = vec![FieldTables::zeros(points, with_dens); norder];
    let mut offset = 0;
    for tables in out.iter_mut() {
        for field in tables.as_blocks_mut() {
            field.copy_from_slice(&flat[offset..offset + points]);
            offset += points;
        }
    }
    out
}

fn broadcast_tables(tables: &mut EofTables, comm: &mut Communicator<f64>) {
    for block in tables.cos.iter_mut().chain(tables.sin.iter_mut()) {
        for function in block.iter_mut() {
            for field in function.as_blocks_mut() {
                comm.broadcast_from(0, field);
            }
        }
    }
}
