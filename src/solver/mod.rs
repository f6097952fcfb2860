//! Distributed Jacobi solve.

pub mod backend;
pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod convergence;
pub mod cpu;
pub mod driver;
pub mod fields;
pub mod gpu;
pub mod gpu_shaders;
pub mod halo;
pub mod kernel;
pub mod partition;

use std::time::Duration;

use crate::config::{BackendKind, SolverConfig};
use crate::error::{PoissonError, Result};
use crate::grid::GlobalField;

use cpu::CpuBackend;
use gpu::WgpuBackend;

pub use convergence::SolveStatus;
pub use driver::{solve_distributed, solve_with, WorkerReport};

/// Result of a finished solve.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub iterations: usize,
    /// Timed region, slowest worker.
    pub elapsed: Duration,
    pub warmup: Duration,
    pub field: GlobalField,
    pub status: SolveStatus,
    /// Global difference at the last check, if any ran.
    pub final_diff: Option<f64>,
    pub checks: usize,
    /// Resolved threshold; `None` in benchmark mode.
    pub tolerance: Option<f64>,
    pub workers: usize,
    pub peer_links: usize,
    pub staged_links: usize,
    /// Halo rows received over direct copies, all workers.
    pub peer_rows: u64,
    /// Halo rows received through host staging, all workers.
    pub staged_rows: u64,
}

impl SolveOutcome {
    pub(crate) fn from_report(report: WorkerReport, workers: usize, peer_links: usize, staged_links: usize) -> Self {
        Self {
            iterations: report.iterations,
            elapsed: report.elapsed,
            warmup: report.warmup,
            field: report.field,
            status: report.status,
            final_diff: report.final_diff,
            checks: report.checks,
            tolerance: report.tolerance,
            workers,
            peer_links,
            staged_links,
            peer_rows: report.peer_rows,
            staged_rows: report.staged_rows,
        }
    }

    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    /// Giga cell updates per second over the timed region.
    pub fn gups(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.field.nx * self.field.ny) as f64 * self.iterations as f64 / (secs * 1e9)
    }
}

/// Solve with one in-process worker per device of the configured kind.
///
/// The configuration is validated before any device is created.
pub fn solve(config: &SolverConfig) -> Result<SolveOutcome> {
    config.validate()?;
    match config.backend {
        BackendKind::Cpu => solve_with(config, (0..config.workers).map(CpuBackend::new).collect()),
        BackendKind::Gpu => {
            let adapters = WgpuBackend::adapter_count();
            if adapters == 0 {
                return Err(PoissonError::Device("no GPU adapter found".into()));
            }
            if adapters < config.workers {
                tracing::warn!(adapters, workers = config.workers, "fewer adapters than workers, sharing adapters");
            }
            let backends = (0..config.workers)
                .map(|rank| WgpuBackend::new(rank % adapters))
                .collect::<Result<Vec<_>>>()?;
            solve_with(config, backends)
        }
    }
}
