//! Five-point Jacobi stencil kernels over host memory.
//!
//! All arrays are row-major `(local_ny + 2) x nx` with halo rows at local rows
//! 0 and `local_ny + 1`. Two kernels compute the same update:
//!
//! - [`reference_step`]: one lane per cell, operands read straight from `prev`.
//! - [`tiled_step`]: `TILE x TILE` tiles stage their cells plus a one-cell apron
//!   in a scratch array, then compute from the scratch copy.
//!
//! Both evaluate [`stencil_point`] on the same operands, so their outputs are
//! bit-identical.

use rayon::prelude::*;

use crate::grid::GlobalGrid;

use super::partition::LocalSubdomain;

/// Edge length of a tile in the scratch-memory kernel.
pub const TILE: usize = 16;

/// Which stencil implementation a backend launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelVariant {
    /// Untiled kernel, one lane per cell.
    Reference,
    /// Scratch-memory kernel with a load/compute barrier per tile.
    #[default]
    Tiled,
}

/// Per-worker constants for the stencil.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilParams {
    pub nx: usize,
    pub local_ny: usize,
    pub is_first: bool,
    pub is_last: bool,
    pub dx2: f64,
    pub dy2: f64,
    pub div_term: f64,
}

impl StencilParams {
    pub fn new(grid: &GlobalGrid, sub: &LocalSubdomain) -> Self {
        let dx2 = grid.dx() * grid.dx();
        let dy2 = grid.dy() * grid.dy();
        Self {
            nx: grid.nx,
            local_ny: sub.local_ny,
            is_first: sub.is_first(),
            is_last: sub.is_last(),
            dx2,
            dy2,
            div_term: 1.0 / (2.0 * (dx2 + dy2)),
        }
    }

    /// Rows in a local array, halos included.
    pub fn rows(&self) -> usize {
        self.local_ny + 2
    }

    pub fn len(&self) -> usize {
        self.rows() * self.nx
    }

    /// Local rows that are global top or bottom edges.
    pub fn is_physical_row(&self, i: usize) -> bool {
        (self.is_first && i == 1) || (self.is_last && i == self.local_ny)
    }

    /// Whether the stencil writes cell `(i, j)`: owned, not a halo, not a global edge.
    pub fn updates_cell(&self, i: usize, j: usize) -> bool {
        j > 0 && j + 1 < self.nx && i >= 1 && i <= self.local_ny && !self.is_physical_row(i)
    }
}

#[inline(always)]
pub fn stencil_point(east: f64, west: f64, south: f64, north: f64, b: f64, p: &StencilParams) -> f64 {
    ((east + west) * p.dy2 + (south + north) * p.dx2 - b * p.dx2 * p.dy2) * p.div_term
}

pub fn step(variant: KernelVariant, out: &mut [f64], prev: &[f64], source: &[f64], p: &StencilParams) {
    match variant {
        KernelVariant::Reference => reference_step(out, prev, source, p),
        KernelVariant::Tiled => tiled_step(out, prev, source, p),
    }
}

pub fn reference_step(out: &mut [f64], prev: &[f64], source: &[f64], p: &StencilParams) {
    let nx = p.nx;
    out.par_chunks_mut(nx).enumerate().for_each(|(i, row)| {
        if i == 0 || i > p.local_ny || p.is_physical_row(i) {
            return;
        }
        for j in 1..nx - 1 {
            let c = i * nx + j;
            row[j] = stencil_point(prev[c + 1], prev[c - 1], prev[c + nx], prev[c - nx], source[c], p);
        }
    });
}

type Scratch = [[f64; TILE + 2]; TILE + 2];

pub fn tiled_step(out: &mut [f64], prev: &[f64], source: &[f64], p: &StencilParams) {
    let nx = p.nx;
    let tiles_x = nx.div_ceil(TILE);
    out.par_chunks_mut(TILE * nx).enumerate().for_each(|(by, band)| {
        let mut scratch: Scratch = [[0.0; TILE + 2]; TILE + 2];
        for bx in 0..tiles_x {
            load_tile(&mut scratch, prev, by, bx, p);
            // Load phase for the whole tile completes before any lane computes.
            compute_tile(&scratch, band, source, by, bx, p);
        }
    });
}

fn load_tile(s: &mut Scratch, prev: &[f64], by: usize, bx: usize, p: &StencilParams) {
    let (nx, rows) = (p.nx, p.rows());
    for row in s.iter_mut() {
        row.fill(0.0);
    }
    for ty in 0..TILE {
        for tx in 0..TILE {
            let (iy, ix) = (by * TILE + ty, bx * TILE + tx);
            if iy >= rows || ix >= nx {
                continue;
            }
            let (sy, sx) = (ty + 1, tx + 1);
            let c = iy * nx + ix;
            s[sy][sx] = prev[c];
            if tx == 0 && ix > 0 {
                s[sy][0] = prev[c - 1];
            }
            if tx == TILE - 1 && ix + 1 < nx {
                s[sy][TILE + 1] = prev[c + 1];
            }
            if ty == 0 && iy > 0 {
                s[0][sx] = prev[c - nx];
            }
            if ty == TILE - 1 && iy + 1 < rows {
                s[TILE + 1][sx] = prev[c + nx];
            }
        }
    }
}

fn compute_tile(s: &Scratch, band: &mut [f64], source: &[f64], by: usize, bx: usize, p: &StencilParams) {
    let (nx, rows) = (p.nx, p.rows());
    for ty in 0..TILE {
        for tx in 0..TILE {
            let (iy, ix) = (by * TILE + ty, bx * TILE + tx);
            if iy >= rows || ix >= nx || !p.updates_cell(iy, ix) {
                continue;
            }
            let (sy, sx) = (ty + 1, tx + 1);
            band[ty * nx + ix] = stencil_point(
                s[sy][sx + 1],
                s[sy][sx - 1],
                s[sy + 1][sx],
                s[sy - 1][sx],
                source[iy * nx + ix],
                p,
            );
        }
    }
}

/// Zero the side columns of every owned row and any owned global top/bottom row.
pub fn apply_boundary(field: &mut [f64], p: &StencilParams) {
    let nx = p.nx;
    for i in 1..=p.local_ny {
        let row = &mut field[i * nx..(i + 1) * nx];
        if p.is_physical_row(i) {
            row.fill(0.0);
        } else {
            row[0] = 0.0;
            row[nx - 1] = 0.0;
        }
    }
}

/// Largest `|a - b|` over the owned rows.
pub fn max_abs_diff(a: &[f64], b: &[f64], p: &StencilParams) -> f64 {
    let owned = p.nx..(p.local_ny + 1) * p.nx;
    a[owned.clone()]
        .par_iter()
        .zip(&b[owned])
        .map(|(x, y)| (x - y).abs())
        .reduce(|| 0.0, nan_max)
}

/// `max` that lets a NaN win, so a diverged field never reads as converged.
pub fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}
