use clap::Parser;
use halopoisson::config::{
    BackendKind, ExchangePolicy, KernelVariant, Mode, SolverConfig, Tolerance, ToleranceSchedule,
};
use halopoisson::grid::GlobalGrid;
use halopoisson::output;
use halopoisson::solver::{self, SolveOutcome};
use halopoisson::stats::Stats;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Multi-device Jacobi solver for the 2D Poisson equation
#[derive(Parser)]
#[command(name = "halopoisson", version)]
struct Cli {
    /// Grid points along x
    #[arg(long, default_value_t = 50)]
    nx: usize,

    /// Grid points along y (split across workers)
    #[arg(long, default_value_t = 50)]
    ny: usize,

    /// Iteration budget
    #[arg(long, default_value_t = 2000)]
    max_iter: usize,

    /// Stop on convergence instead of running a fixed iteration count
    #[arg(long)]
    physics: bool,

    /// Absolute convergence tolerance
    #[arg(long, conflicts_with_all = ["base_tol", "base_size"])]
    tolerance: Option<f64>,

    /// Tolerance at the base grid size; scaled by (size / base_size)^2
    #[arg(long)]
    base_tol: Option<f64>,

    /// Grid size at which the base tolerance applies
    #[arg(long)]
    base_size: Option<usize>,

    /// Iterations between convergence checks
    #[arg(long, default_value_t = 100)]
    check_interval: usize,

    /// Number of workers, one device each
    #[arg(long, env = "HALOPOISSON_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Use host-memory devices instead of GPUs
    #[arg(long)]
    cpu: bool,

    /// Use the untiled stencil kernel
    #[arg(long)]
    reference_kernel: bool,

    /// Always exchange halos through host memory
    #[arg(long)]
    host_staged: bool,

    /// Write the final field as CSV to this path
    #[arg(long, conflicts_with = "sweep")]
    csv: Option<PathBuf>,

    /// Run physics mode over these square grid sizes and print a table
    #[arg(long, value_delimiter = ',')]
    sweep: Vec<usize>,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,

    /// Run as one rank of an MPI job
    #[cfg(feature = "distributed")]
    #[arg(long, conflicts_with = "sweep")]
    mpi: bool,
}

impl Cli {
    fn schedule(&self) -> ToleranceSchedule {
        let defaults = ToleranceSchedule::default();
        ToleranceSchedule::new(
            self.base_tol.unwrap_or(defaults.base_tol),
            self.base_size.unwrap_or(defaults.base_size),
        )
    }

    fn config(&self) -> SolverConfig {
        let tolerance = match self.tolerance {
            Some(tol) => Tolerance::Absolute(tol),
            None if self.base_tol.is_some() || self.base_size.is_some() => Tolerance::Scaled(self.schedule()),
            None => SolverConfig::default().tolerance,
        };
        SolverConfig {
            nx: self.nx,
            ny: self.ny,
            max_iter: self.max_iter,
            check_interval: self.check_interval,
            mode: if self.physics { Mode::Physics } else { Mode::Benchmark },
            tolerance,
            workers: self.workers,
            kernel: if self.reference_kernel { KernelVariant::Reference } else { KernelVariant::Tiled },
            exchange: if self.host_staged { ExchangePolicy::HostStaged } else { ExchangePolicy::PreferPeer },
            backend: if self.cpu { BackendKind::Cpu } else { BackendKind::Gpu },
            ..SolverConfig::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stats = if cli.stats { Some(Stats::new()) } else { None };
    let config = cli.config();

    #[cfg(feature = "distributed")]
    if cli.mpi {
        run_mpi(&cli, config, stats.as_mut());
        return;
    }

    if cli.sweep.is_empty() {
        run_single(&cli, &config, stats.as_mut());
    } else {
        run_sweep(&cli, &config, stats.as_mut());
    }

    if let Some(ref stats) = stats {
        stats.display();
    }
}

fn grid_or_exit(config: &SolverConfig) -> GlobalGrid {
    config.validate().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    })
}

fn report(cli: &Cli, grid: &GlobalGrid, outcome: &SolveOutcome, stats: Option<&mut Stats>) {
    let mut stdout = io::stdout();
    output::write_summary(grid, outcome, &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });
    if let Some(path) = &cli.csv {
        write_csv(path, grid, outcome).unwrap_or_else(|e| {
            eprintln!("Error writing {}: {}", path.display(), e);
            std::process::exit(1);
        });
    }
    if let Some(stats) = stats {
        stats.record(outcome);
    }
}

fn write_csv(path: &Path, grid: &GlobalGrid, outcome: &SolveOutcome) -> halopoisson::error::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    output::write_field_csv(grid, &outcome.field, &mut file)?;
    file.flush()?;
    Ok(())
}

fn run_single(cli: &Cli, config: &SolverConfig, stats: Option<&mut Stats>) {
    let grid = grid_or_exit(config);
    let outcome = solver::solve(config).unwrap_or_else(|e| {
        eprintln!("Solve error: {}", e);
        std::process::exit(1);
    });
    report(cli, &grid, &outcome, stats);
}

fn run_sweep(cli: &Cli, base: &SolverConfig, mut stats: Option<&mut Stats>) {
    let mut rows = Vec::with_capacity(cli.sweep.len());
    for &size in &cli.sweep {
        let config = SolverConfig {
            nx: size,
            ny: size,
            mode: Mode::Physics,
            tolerance: Tolerance::Scaled(cli.schedule()),
            ..base.clone()
        };
        grid_or_exit(&config);
        let outcome = solver::solve(&config).unwrap_or_else(|e| {
            eprintln!("Solve error at {size}x{size}: {}", e);
            std::process::exit(1);
        });
        if let Some(stats) = stats.as_deref_mut() {
            stats.record(&outcome);
        }
        rows.push((size, outcome));
    }
    output::write_sweep_table(&rows, &mut io::stdout()).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });
}

#[cfg(feature = "distributed")]
fn run_mpi(cli: &Cli, mut config: SolverConfig, mut stats: Option<&mut Stats>) {
    use halopoisson::config::local_rank_from_env;
    use halopoisson::solver::comm::CommunicationBackend;
    use halopoisson::solver::comm_mpi::MpiComm;
    use halopoisson::solver::cpu::CpuBackend;
    use halopoisson::solver::gpu::WgpuBackend;

    let Some(_universe) = mpi::initialize() else {
        eprintln!("MPI initialization failed");
        std::process::exit(1);
    };
    let comm = MpiComm::new();
    config.workers = comm.num_ranks();
    let grid = grid_or_exit(&config);
    let device = local_rank_from_env();

    let outcome = if cli.cpu {
        solver::solve_distributed(&config, CpuBackend::new(device), &comm)
    } else {
        WgpuBackend::new(device).and_then(|gpu| solver::solve_distributed(&config, gpu, &comm))
    }
    .unwrap_or_else(|e| {
        eprintln!("Rank {} solve error: {}", comm.rank(), e);
        comm.abort();
        std::process::exit(1);
    });

    if comm.rank() == 0 {
        report(cli, &grid, &outcome, stats.as_deref_mut());
        if let Some(stats) = stats {
            stats.display();
        }
    }
}
