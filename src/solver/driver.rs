//! The iterate / exchange / check loop and the entry points that launch it.
//!
//! A solve runs one `Worker` per subdomain. Every worker executes the same
//! sequence, so the group stays in lockstep:
//!
//! 1. warm-up launch (untimed, leaves the fields as they were), barrier
//! 2. per iteration: advance the buffer, stencil, boundary, synchronize,
//!    halo exchange, and on due iterations a global max reduction
//! 3. barrier, elapsed time reduced to the slowest worker, field gathered

use std::time::{Duration, Instant};

use crate::config::{KernelVariant, SolverConfig};
use crate::error::{PoissonError, Result};
use crate::grid::{GlobalField, GlobalGrid};

use super::backend::StencilBackend;
use super::comm::{CommunicationBackend, ThreadComm};
use super::convergence::{ConvergenceMonitor, SolveStatus};
use super::fields::FieldSet;
use super::halo::{negotiate_peer_access, HaloExchanger, HaloLink, LinkPath, PeerTopology};
use super::kernel::StencilParams;
use super::partition::{GridPartitioner, LocalSubdomain};
use super::SolveOutcome;

/// One subdomain bound to one device.
pub struct Worker<B: StencilBackend> {
    backend: B,
    sub: LocalSubdomain,
    params: StencilParams,
    fields: FieldSet<B::Field>,
    exchanger: HaloExchanger<B::PeerView>,
    kernel: KernelVariant,
}

/// What one worker knows at the end of its run. Group-wide figures
/// (elapsed, halo row counts, the field) are already reduced.
pub struct WorkerReport {
    pub iterations: usize,
    pub checks: usize,
    pub status: SolveStatus,
    pub final_diff: Option<f64>,
    pub tolerance: Option<f64>,
    pub warmup: Duration,
    pub elapsed: Duration,
    pub peer_rows: u64,
    pub staged_rows: u64,
    pub field: GlobalField,
}

impl<B: StencilBackend> Worker<B> {
    pub fn new(
        backend: B,
        grid: &GlobalGrid,
        sub: LocalSubdomain,
        fields: FieldSet<B::Field>,
        exchanger: HaloExchanger<B::PeerView>,
        kernel: KernelVariant,
    ) -> Self {
        Self {
            params: StencilParams::new(grid, &sub),
            backend,
            sub,
            fields,
            exchanger,
            kernel,
        }
    }

    pub fn subdomain(&self) -> &LocalSubdomain {
        &self.sub
    }

    /// One throwaway launch into the idle slot, which is then zeroed again.
    /// The slot index does not move.
    pub fn warmup(&mut self) -> Result<()> {
        let pair = &self.fields.pair;
        self.backend.launch_stencil(
            self.kernel,
            pair.previous(),
            pair.current(),
            &self.fields.source,
            &self.params,
        )?;
        self.backend.upload(pair.previous(), &vec![0.0; self.sub.local_len()])?;
        self.backend.synchronize()
    }

    /// Advance the buffer and compute the new iterate with boundaries applied.
    pub fn step(&mut self) -> Result<()> {
        self.fields.pair.advance();
        let pair = &self.fields.pair;
        self.backend.launch_stencil(
            self.kernel,
            pair.current(),
            pair.previous(),
            &self.fields.source,
            &self.params,
        )?;
        self.backend.apply_boundary(pair.current(), &self.params)?;
        self.backend.synchronize()
    }

    pub fn exchange(&mut self, comm: &dyn CommunicationBackend) -> Result<()> {
        self.exchanger
            .exchange(&self.backend, &self.sub, &self.fields.pair, comm)
    }

    /// Largest change over owned rows between the latest two iterates.
    pub fn local_diff(&self) -> Result<f64> {
        let pair = &self.fields.pair;
        self.backend
            .max_abs_diff(pair.current(), pair.previous(), &self.params)
    }

    /// Host copy of the current local array, halos included.
    pub fn snapshot(&self) -> Result<Vec<f64>> {
        let mut local = vec![0.0; self.sub.local_len()];
        self.backend.download(self.fields.pair.current(), &mut local)?;
        Ok(local)
    }

    /// Assemble the global field on every rank.
    pub fn gather(&self, comm: &dyn CommunicationBackend) -> Result<GlobalField> {
        let nx = self.sub.nx;
        let local = self.snapshot()?;
        let mut global = GlobalField::zeros(nx, self.sub.num_ranks * self.sub.local_ny);
        let start = self.sub.row_start * nx;
        global.data[start..start + self.sub.local_ny * nx]
            .copy_from_slice(&local[nx..(self.sub.local_ny + 1) * nx]);
        comm.all_reduce_sum_vec(&mut global.data)?;
        Ok(global)
    }

    /// Run the whole solve on this worker.
    pub fn run(
        &mut self,
        config: &SolverConfig,
        grid: &GlobalGrid,
        comm: &dyn CommunicationBackend,
    ) -> Result<WorkerReport> {
        let _span = tracing::debug_span!(
            "worker",
            rank = self.sub.rank,
            ordinal = self.backend.ordinal(),
            device = %self.backend.name()
        )
        .entered();
        let mut monitor = ConvergenceMonitor::new(config, grid);

        let warm_start = Instant::now();
        self.warmup()?;
        comm.barrier()?;
        let warmup = warm_start.elapsed();

        monitor.begin_running();
        let start = Instant::now();
        while monitor.is_running() {
            self.step()?;
            self.exchange(comm)?;
            if monitor.record_iteration() {
                let local = self.local_diff()?;
                let global = comm.all_reduce_max(local)?;
                tracing::trace!(local, global, "diff");
                monitor.record_check(global);
            }
            monitor.settle();
        }
        self.backend.synchronize()?;
        comm.barrier()?;
        let elapsed = comm.all_reduce_max(start.elapsed().as_secs_f64())?;

        let mut rows = [self.exchanger.peer_rows as f64, self.exchanger.staged_rows as f64];
        comm.all_reduce_sum_vec(&mut rows)?;
        let field = self.gather(comm)?;

        let status = monitor
            .status()
            .ok_or_else(|| PoissonError::Device("iteration loop left without a terminal state".into()))?;
        tracing::debug!(iterations = monitor.iterations(), %status, "worker finished");

        Ok(WorkerReport {
            iterations: monitor.iterations(),
            checks: monitor.checks(),
            status,
            final_diff: monitor.last_diff(),
            tolerance: monitor.tolerance(),
            warmup,
            elapsed: Duration::from_secs_f64(elapsed),
            peer_rows: rows[0] as u64,
            staged_rows: rows[1] as u64,
            field,
        })
    }
}

/// Bind each backend to its subdomain, allocate fields and wire up halo links.
///
/// An adjacency copies directly only if `negotiated` allows it and both
/// devices can export their fields; otherwise both sides stage through host
/// memory. Returns the workers and the topology actually in effect.
pub fn assemble_workers<B: StencilBackend>(
    config: &SolverConfig,
    grid: &GlobalGrid,
    backends: Vec<B>,
    negotiated: &PeerTopology,
) -> Result<(Vec<Worker<B>>, PeerTopology)> {
    let subs = GridPartitioner::partition(grid, config.workers)?;
    if backends.len() != subs.len() {
        return Err(PoissonError::Configuration(format!(
            "{} devices supplied for {} workers",
            backends.len(),
            subs.len()
        )));
    }

    let fields = backends
        .iter()
        .zip(&subs)
        .map(|(backend, sub)| FieldSet::allocate(backend, grid, sub))
        .collect::<Result<Vec<_>>>()?;

    let export = |r: usize| {
        let slots = fields[r].pair.slots();
        Some([backends[r].export_peer(&slots[0])?, backends[r].export_peer(&slots[1])?])
    };

    // (link held by the upper rank, link held by the lower rank) per adjacency.
    let mut ups: Vec<Option<HaloLink<B::PeerView>>> = (0..subs.len()).map(|_| None).collect();
    let mut downs: Vec<Option<HaloLink<B::PeerView>>> = (0..subs.len()).map(|_| None).collect();
    let mut effective = PeerTopology::host_staged(subs.len());
    for upper in 0..subs.len().saturating_sub(1) {
        let lower = upper + 1;
        let views = if negotiated.is_direct(upper) {
            export(lower).zip(export(upper))
        } else {
            None
        };
        match views {
            Some((of_lower, of_upper)) => {
                downs[upper] = Some(HaloLink { peer: lower, path: LinkPath::Direct(of_lower) });
                ups[lower] = Some(HaloLink { peer: upper, path: LinkPath::Direct(of_upper) });
                effective.mark_direct(upper);
            }
            None => {
                downs[upper] = Some(HaloLink::host_staged(lower));
                ups[lower] = Some(HaloLink::host_staged(upper));
            }
        }
    }

    let group_has_direct = effective.any_direct();
    let workers = backends
        .into_iter()
        .zip(subs)
        .zip(fields)
        .zip(ups.into_iter().zip(downs))
        .map(|(((backend, sub), fields), (up, down))| {
            let exchanger = HaloExchanger::new(&sub, up, down, group_has_direct);
            Worker::new(backend, grid, sub, fields, exchanger, config.kernel)
        })
        .collect();
    Ok((workers, effective))
}

/// Solve on explicitly constructed devices, one in-process worker each.
///
/// `backends[r]` serves rank `r`; there must be exactly `config.workers` of
/// them.
pub fn solve_with<B: StencilBackend>(config: &SolverConfig, backends: Vec<B>) -> Result<SolveOutcome> {
    let grid = config.validate()?;
    let _span = tracing::info_span!("solve", nx = grid.nx, ny = grid.ny, workers = config.workers).entered();

    let negotiated = negotiate_peer_access(&backends, config.exchange);
    let (mut workers, topology) = assemble_workers(config, &grid, backends, &negotiated)?;
    let comms = ThreadComm::group(workers.len());

    let results: Vec<Result<WorkerReport>> = std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter_mut()
            .zip(&comms)
            .map(|(worker, comm)| {
                let grid = &grid;
                s.spawn(move || {
                    let report = worker.run(config, grid, comm);
                    if report.is_err() {
                        comm.abort();
                    }
                    report
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .unwrap_or_else(|_| Err(PoissonError::Device(format!("worker {rank} panicked"))))
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => errors.push(e),
        }
    }
    // Aborted peers only report the fallout; surface the root cause.
    if let Some(e) = errors
        .into_iter()
        .min_by_key(|e| matches!(e, PoissonError::Comm(_)))
    {
        return Err(e);
    }
    let report = reports
        .into_iter()
        .next()
        .ok_or_else(|| PoissonError::Configuration("no workers ran".into()))?;

    Ok(SolveOutcome::from_report(
        report,
        config.workers,
        topology.direct_links(),
        topology.staged_links(),
    ))
}

/// Solve as one member of a multi-process group, on this process's device.
///
/// Every rank must call this with the same configuration. Devices in
/// different processes cannot map each other's memory, so every adjacency is
/// host-staged.
pub fn solve_distributed<B: StencilBackend>(
    config: &SolverConfig,
    backend: B,
    comm: &dyn CommunicationBackend,
) -> Result<SolveOutcome> {
    let grid = config.validate()?;
    if comm.num_ranks() != config.workers {
        return Err(PoissonError::Configuration(format!(
            "process group has {} ranks, configuration asks for {} workers",
            comm.num_ranks(),
            config.workers
        )));
    }
    let _span = tracing::info_span!("solve", nx = grid.nx, ny = grid.ny, rank = comm.rank()).entered();

    let sub = GridPartitioner::subdomain(&grid, config.workers, comm.rank())?;
    let fields = FieldSet::allocate(&backend, &grid, &sub)?;
    let exchanger = HaloExchanger::host_staged(&sub);
    let mut worker = Worker::new(backend, &grid, sub, fields, exchanger, config.kernel);

    let report = worker.run(config, &grid, comm).inspect_err(|_| comm.abort())?;
    let links = config.workers - 1;
    Ok(SolveOutcome::from_report(report, config.workers, 0, links))
}
