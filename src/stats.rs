//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

use crate::solver::SolveOutcome;

/// Collects performance counters and phase timings.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub solves: u32,
    pub iterations: usize,
    pub checks: usize,
    pub workers: usize,
    // Halo exchange
    pub peer_links: usize,
    pub staged_links: usize,
    pub peer_rows: u64,
    pub staged_rows: u64,
    // Throughput of the last solve
    pub gups: f64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            solves: 0,
            iterations: 0,
            checks: 0,
            workers: 0,
            peer_links: 0,
            staged_links: 0,
            peer_rows: 0,
            staged_rows: 0,
            gups: 0.0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    /// Fold one finished solve into the counters.
    pub fn record(&mut self, outcome: &SolveOutcome) {
        self.add_phase("warm-up", outcome.warmup);
        self.add_phase("iterate", outcome.elapsed);
        self.solves += 1;
        self.iterations += outcome.iterations;
        self.checks += outcome.checks;
        self.workers = outcome.workers;
        self.peer_links = outcome.peer_links;
        self.staged_links = outcome.staged_links;
        self.peer_rows += outcome.peer_rows;
        self.staged_rows += outcome.staged_rows;
        self.gups = outcome.gups();
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== halopoisson Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.solves > 1 {
            eprintln!("  Solves:                 {}", self.solves);
        }
        eprintln!("  Iterations:             {}", self.iterations);
        eprintln!("  Convergence checks:     {}", self.checks);
        eprintln!("  Workers:                {}", self.workers);

        if self.peer_links + self.staged_links > 0 {
            eprintln!("  Halo links:             direct={}  staged={}", self.peer_links, self.staged_links);
            eprintln!("  Halo rows:              direct={}  staged={}", self.peer_rows, self.staged_rows);
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
        eprintln!("  Throughput:             {:>8.3} GUPS", self.gups);
    }
}
