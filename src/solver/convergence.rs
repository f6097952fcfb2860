//! Termination control for the iteration loop.
//!
//! ```text
//! WARMUP  -> RUNNING
//! RUNNING -> RUNNING           no check, or the check fails
//! RUNNING -> CONVERGED         a check passes
//! RUNNING -> MAX_ITER_REACHED  the counter reaches max_iter
//! ```
//!
//! Every rank runs its own monitor. Checks are fed the *global* difference,
//! so all ranks take identical transitions.

use crate::config::{Mode, SolverConfig};
use crate::grid::GlobalGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Warmup,
    Running,
    Converged,
    MaxIterReached,
}

/// Terminal state of a finished solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    MaxIterReached,
}

impl std::fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveStatus::Converged => write!(f, "converged"),
            SolveStatus::MaxIterReached => write!(f, "max-iter"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    mode: Mode,
    tolerance: Option<f64>,
    check_interval: usize,
    max_iter: usize,
    state: SolveState,
    iterations: usize,
    checks: usize,
    last_diff: Option<f64>,
}

impl ConvergenceMonitor {
    pub fn new(config: &SolverConfig, grid: &GlobalGrid) -> Self {
        Self {
            mode: config.mode,
            tolerance: config.resolved_tolerance(grid),
            check_interval: config.check_interval,
            max_iter: config.max_iter,
            state: SolveState::Warmup,
            iterations: 0,
            checks: 0,
            last_diff: None,
        }
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SolveState::Running
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn checks(&self) -> usize {
        self.checks
    }

    pub fn last_diff(&self) -> Option<f64> {
        self.last_diff
    }

    /// Resolved threshold; `None` in benchmark mode.
    pub fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    /// Leave WARMUP. A zero iteration budget is exhausted immediately.
    pub fn begin_running(&mut self) {
        if self.state != SolveState::Warmup {
            return;
        }
        self.state = if self.max_iter == 0 {
            SolveState::MaxIterReached
        } else {
            SolveState::Running
        };
    }

    /// Count one completed iteration and report whether a check is due now.
    pub fn record_iteration(&mut self) -> bool {
        self.iterations += 1;
        self.check_due()
    }

    /// Physics mode checks after iterations that are multiples of the interval.
    pub fn check_due(&self) -> bool {
        self.state == SolveState::Running
            && self.mode == Mode::Physics
            && self.check_interval > 0
            && self.iterations > 0
            && self.iterations % self.check_interval == 0
    }

    /// Feed the global difference of a due check.
    pub fn record_check(&mut self, global_diff: f64) {
        self.checks += 1;
        self.last_diff = Some(global_diff);
        // NaN compares false and keeps the solve running.
        if let Some(tol) = self.tolerance {
            if global_diff < tol {
                self.state = SolveState::Converged;
                tracing::info!(iteration = self.iterations, diff = global_diff, tol, "converged");
                return;
            }
        }
        tracing::debug!(iteration = self.iterations, diff = global_diff, "convergence check");
    }

    /// Close out the iteration: exhaust the budget if nothing else stopped the loop.
    pub fn settle(&mut self) -> SolveState {
        if self.state == SolveState::Running && self.iterations >= self.max_iter {
            self.state = SolveState::MaxIterReached;
        }
        self.state
    }

    /// Terminal status, or `None` while the solve is still going.
    pub fn status(&self) -> Option<SolveStatus> {
        match self.state {
            SolveState::Converged => Some(SolveStatus::Converged),
            SolveState::MaxIterReached => Some(SolveStatus::MaxIterReached),
            SolveState::Warmup | SolveState::Running => None,
        }
    }
}
