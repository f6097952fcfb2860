//! Row-block domain decomposition.
//!
//! The global grid is cut along y into `workers` contiguous blocks of equal
//! height. Every block is stored with one halo row above and one below:
//!
//! ```text
//! local row 0              halo (copy of the upper neighbour's last owned row)
//! local rows 1..=local_ny  owned rows
//! local row local_ny + 1   halo (copy of the lower neighbour's first owned row)
//! ```
//!
//! The first worker's top halo and the last worker's bottom halo have no
//! neighbour and stay zero.

use std::ops::Range;

use crate::error::{PoissonError, Result};
use crate::grid::GlobalGrid;

/// One worker's slice of the global grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSubdomain {
    pub rank: usize,
    pub num_ranks: usize,
    /// First owned global row.
    pub row_start: usize,
    /// Number of owned rows.
    pub local_ny: usize,
    pub nx: usize,
}

impl LocalSubdomain {
    /// Global rows owned by this worker.
    pub fn owned_rows(&self) -> Range<usize> {
        self.row_start..self.row_start + self.local_ny
    }

    /// Rows in the local arrays, halos included.
    pub fn local_rows(&self) -> usize {
        self.local_ny + 2
    }

    /// Elements in one local array.
    pub fn local_len(&self) -> usize {
        self.local_rows() * self.nx
    }

    pub fn is_first(&self) -> bool {
        self.rank == 0
    }

    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.num_ranks
    }

    /// Local index of the top halo row.
    pub fn halo_top(&self) -> usize {
        0
    }

    /// Local index of the bottom halo row.
    pub fn halo_bottom(&self) -> usize {
        self.local_ny + 1
    }

    pub fn first_owned(&self) -> usize {
        1
    }

    pub fn last_owned(&self) -> usize {
        self.local_ny
    }

    /// Rank above this one, if any.
    pub fn upper_neighbor(&self) -> Option<usize> {
        (!self.is_first()).then(|| self.rank - 1)
    }

    /// Rank below this one, if any.
    pub fn lower_neighbor(&self) -> Option<usize> {
        (!self.is_last()).then(|| self.rank + 1)
    }

    /// Local row holding `global_row`, if this worker owns it.
    pub fn to_local(&self, global_row: usize) -> Option<usize> {
        self.owned_rows()
            .contains(&global_row)
            .then(|| global_row - self.row_start + 1)
    }
}

/// Splits a `GlobalGrid` into equal row blocks.
pub struct GridPartitioner;

impl GridPartitioner {
    /// Subdomains for every rank, in rank order.
    pub fn partition(grid: &GlobalGrid, workers: usize) -> Result<Vec<LocalSubdomain>> {
        (0..workers)
            .map(|rank| Self::subdomain(grid, workers, rank))
            .collect()
    }

    /// Subdomain owned by `rank`.
    pub fn subdomain(grid: &GlobalGrid, workers: usize, rank: usize) -> Result<LocalSubdomain> {
        if workers == 0 || workers > grid.ny {
            return Err(PoissonError::Configuration(format!(
                "unsupported worker count {workers} for ny={}",
                grid.ny
            )));
        }
        if grid.ny % workers != 0 {
            return Err(PoissonError::Configuration(format!(
                "ny={} must be divisible by worker count {workers}",
                grid.ny
            )));
        }
        if rank >= workers {
            return Err(PoissonError::Configuration(format!(
                "rank {rank} out of range for {workers} workers"
            )));
        }
        let local_ny = grid.ny / workers;
        Ok(LocalSubdomain {
            rank,
            num_ranks: workers,
            row_start: rank * local_ny,
            local_ny,
            nx: grid.nx,
        })
    }

    /// Point sources that fall inside `sub`, as (local_row, col, value).
    pub fn local_sources(grid: &GlobalGrid, sub: &LocalSubdomain) -> Vec<(usize, usize, f64)> {
        grid.sources()
            .iter()
            .filter_map(|src| sub.to_local(src.row).map(|row| (row, src.col, src.value)))
            .collect()
    }

    /// Host image of the local source term `b`, halos included.
    pub fn source_field(grid: &GlobalGrid, sub: &LocalSubdomain) -> Vec<f64> {
        let mut b = vec![0.0; sub.local_len()];
        for (row, col, value) in Self::local_sources(grid, sub) {
            b[row * sub.nx + col] = value;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Bounds;

    fn grid(nx: usize, ny: usize) -> GlobalGrid {
        GlobalGrid::new(nx, ny, Bounds::default()).unwrap()
    }

    #[test]
    fn owned_rows_cover_the_grid_exactly() {
        let g = grid(16, 24);
        for workers in [1, 2, 3, 4, 6, 8] {
            let subs = GridPartitioner::partition(&g, workers).unwrap();
            let total: usize = subs.iter().map(|s| s.local_ny).sum();
            assert_eq!(total, g.ny);
            for pair in subs.windows(2) {
                assert_eq!(pair[0].owned_rows().end, pair[1].owned_rows().start);
            }
            assert_eq!(subs[0].owned_rows().start, 0);
            assert_eq!(subs[workers - 1].owned_rows().end, g.ny);
        }
    }

    #[test]
    fn single_worker_owns_everything() {
        let sub = GridPartitioner::subdomain(&grid(10, 10), 1, 0).unwrap();
        assert!(sub.is_first() && sub.is_last());
        assert_eq!(sub.local_rows(), 12);
        assert_eq!(sub.upper_neighbor(), None);
        assert_eq!(sub.lower_neighbor(), None);
    }

    #[test]
    fn indivisible_rows_are_rejected() {
        let err = GridPartitioner::partition(&grid(10, 10), 3).unwrap_err();
        assert!(matches!(err, PoissonError::Configuration(_)));
    }

    #[test]
    fn neighbours_in_the_middle() {
        let sub = GridPartitioner::subdomain(&grid(8, 12), 3, 1).unwrap();
        assert_eq!(sub.upper_neighbor(), Some(0));
        assert_eq!(sub.lower_neighbor(), Some(2));
        assert_eq!(sub.owned_rows(), 4..8);
        assert_eq!(sub.halo_bottom(), 5);
    }

    #[test]
    fn sources_land_on_their_owner_only() {
        // ny=256: sources at global rows 64 and 192.
        let g = grid(128, 256);
        let subs = GridPartitioner::partition(&g, 2).unwrap();
        let top = GridPartitioner::local_sources(&g, &subs[0]);
        let bottom = GridPartitioner::local_sources(&g, &subs[1]);
        assert_eq!(top, vec![(65, 32, 100.0)]);
        assert_eq!(bottom, vec![(192 - 128 + 1, 96, -100.0)]);
    }

    #[test]
    fn source_field_matches_global_placement() {
        let g = grid(20, 20);
        for workers in [1, 2, 4] {
            let subs = GridPartitioner::partition(&g, workers).unwrap();
            let mut placed = 0.0;
            for sub in &subs {
                let b = GridPartitioner::source_field(&g, sub);
                assert_eq!(b.len(), sub.local_len());
                for row in [sub.halo_top(), sub.halo_bottom()] {
                    assert!(b[row * sub.nx..(row + 1) * sub.nx].iter().all(|&v| v == 0.0));
                }
                placed += b.iter().map(|v| v.abs()).sum::<f64>();
            }
            assert_eq!(placed, 200.0);
        }
    }
}
