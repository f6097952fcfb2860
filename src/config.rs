//! Solve configuration.
//!
//! Everything a solve depends on is carried in a `SolverConfig` value passed
//! to the entry point, so independent solves can run side by side.

use crate::error::{PoissonError, Result};
use crate::grid::{Bounds, GlobalGrid};

pub use crate::solver::kernel::KernelVariant;

/// Operating mode of the iteration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Fixed iteration count, no convergence checks.
    #[default]
    Benchmark,
    /// Periodic convergence checks against the tolerance.
    Physics,
}

/// Resolution-scaled tolerance: `base_tol / (size / base_size)^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceSchedule {
    pub base_tol: f64,
    pub base_size: usize,
}

impl ToleranceSchedule {
    pub fn new(base_tol: f64, base_size: usize) -> Self {
        Self {
            base_tol,
            base_size,
        }
    }

    pub fn tolerance_for(&self, size: usize) -> f64 {
        let ratio = size as f64 / self.base_size as f64;
        self.base_tol / (ratio * ratio)
    }
}

impl Default for ToleranceSchedule {
    fn default() -> Self {
        Self::new(1e-7, 50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    /// Same threshold at every resolution.
    Absolute(f64),
    Scaled(ToleranceSchedule),
}

impl Tolerance {
    pub fn resolve(&self, grid: &GlobalGrid) -> f64 {
        match self {
            Tolerance::Absolute(tol) => *tol,
            Tolerance::Scaled(schedule) => schedule.tolerance_for(grid.size()),
        }
    }
}

/// How adjacent workers move halo rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePolicy {
    /// Direct device-to-device copies where peer access can be enabled.
    #[default]
    PreferPeer,
    /// Always stage rows through host memory.
    HostStaged,
}

/// Device family the in-process launcher instantiates per worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Host memory with rayon-parallel kernels.
    #[default]
    Cpu,
    /// One wgpu adapter per worker.
    Gpu,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub nx: usize,
    pub ny: usize,
    pub bounds: Bounds,
    pub max_iter: usize,
    pub check_interval: usize,
    pub mode: Mode,
    pub tolerance: Tolerance,
    pub workers: usize,
    pub kernel: KernelVariant,
    pub exchange: ExchangePolicy,
    pub backend: BackendKind,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            nx: 50,
            ny: 50,
            bounds: Bounds::default(),
            max_iter: 2000,
            check_interval: 100,
            mode: Mode::Benchmark,
            tolerance: Tolerance::Absolute(1e-6),
            workers: 1,
            kernel: KernelVariant::default(),
            exchange: ExchangePolicy::default(),
            backend: BackendKind::default(),
        }
    }
}

impl SolverConfig {
    /// Fixed-iteration throughput run.
    pub fn benchmark(nx: usize, ny: usize, max_iter: usize) -> Self {
        Self {
            nx,
            ny,
            max_iter,
            mode: Mode::Benchmark,
            ..Self::default()
        }
    }

    /// Convergence-checked run.
    pub fn physics(nx: usize, ny: usize, max_iter: usize, tolerance: Tolerance) -> Self {
        Self {
            nx,
            ny,
            max_iter,
            mode: Mode::Physics,
            tolerance,
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelVariant) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_exchange(mut self, exchange: ExchangePolicy) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_check_interval(mut self, check_interval: usize) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn grid(&self) -> Result<GlobalGrid> {
        GlobalGrid::new(self.nx, self.ny, self.bounds)
    }

    /// Threshold the monitor compares against, or `None` in benchmark mode.
    pub fn resolved_tolerance(&self, grid: &GlobalGrid) -> Option<f64> {
        match self.mode {
            Mode::Benchmark => None,
            Mode::Physics => Some(self.tolerance.resolve(grid)),
        }
    }

    /// Check everything that can be checked without touching a device.
    pub fn validate(&self) -> Result<GlobalGrid> {
        let grid = self.grid()?;
        if self.workers == 0 || self.workers > self.ny {
            return Err(PoissonError::Configuration(format!(
                "unsupported worker count {} for ny={}",
                self.workers, self.ny
            )));
        }
        if self.ny % self.workers != 0 {
            return Err(PoissonError::Configuration(format!(
                "ny={} must be divisible by worker count {}",
                self.ny, self.workers
            )));
        }
        if self.mode == Mode::Physics {
            if self.check_interval == 0 {
                return Err(PoissonError::Configuration(
                    "check interval must be at least 1 in physics mode".into(),
                ));
            }
            let tol = self.tolerance.resolve(&grid);
            if !(tol.is_finite() && tol > 0.0) {
                return Err(PoissonError::Configuration(format!(
                    "tolerance must be positive and finite, got {tol}"
                )));
            }
            if let Tolerance::Scaled(schedule) = self.tolerance {
                if schedule.base_size == 0 {
                    return Err(PoissonError::Configuration(
                        "tolerance base size must be non-zero".into(),
                    ));
                }
            }
        }
        Ok(grid)
    }
}

/// Node-local rank as exported by the launcher, used to pick a device.
///
/// Checks `SLURM_LOCALID`, then `OMPI_COMM_WORLD_LOCAL_RANK`, then
/// `MPI_LOCALRANKID`; defaults to 0.
pub fn local_rank_from_env() -> usize {
    ["SLURM_LOCALID", "OMPI_COMM_WORLD_LOCAL_RANK", "MPI_LOCALRANKID"]
        .iter()
        .find_map(|key| std::env::var(key).ok()?.trim().parse().ok())
        .unwrap_or(0)
}
