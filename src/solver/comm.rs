//! Process-group abstraction for multi-worker solves.
//!
//! Provides a trait for the collective operations the iteration loop needs
//! (barriers, max reductions, boundary-row exchange), a no-op single-process
//! implementation, and an in-process thread group.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{PoissonError, Result};

use super::kernel::nan_max;

/// Abstraction over the group of workers taking part in one solve.
///
/// Implementations: `SingleProcessComm` (no-op), `ThreadComm` (one thread per
/// worker), `MpiComm` (one process per worker, feature `distributed`).
pub trait CommunicationBackend: Send + Sync {
    /// This worker's rank (subdomain index).
    fn rank(&self) -> usize;

    /// Total number of ranks (subdomains).
    fn num_ranks(&self) -> usize;

    /// Max of a local scalar across all ranks. A NaN on any rank wins.
    fn all_reduce_max(&self, local: f64) -> Result<f64>;

    /// Element-wise sum of a vector across all ranks, in place.
    ///
    /// Each rank contributes its local values (zeros for non-owned positions).
    /// After the call, every rank holds the global sum. Used for reassembling
    /// the final field.
    fn all_reduce_sum_vec(&self, local: &mut [f64]) -> Result<()>;

    /// Send `send` to `peer` and receive `recv.len()` values from it.
    ///
    /// Both sides must call this with each other as `peer`; the combined call
    /// never deadlocks on its own.
    fn send_recv(&self, peer: usize, send: &[f64], recv: &mut [f64]) -> Result<()>;

    /// Synchronization barrier.
    fn barrier(&self) -> Result<()>;

    /// Tell the rest of the group this rank is bailing out.
    fn abort(&self) {}
}

/// No-op communication backend for single-worker execution.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn all_reduce_max(&self, local: f64) -> Result<f64> {
        Ok(local)
    }

    fn all_reduce_sum_vec(&self, _local: &mut [f64]) -> Result<()> {
        // Single process: vector is already complete.
        Ok(())
    }

    fn send_recv(&self, peer: usize, _send: &[f64], _recv: &mut [f64]) -> Result<()> {
        Err(PoissonError::Comm(format!(
            "single-process group has no rank {peer}"
        )))
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that releases every waiter with an error once aborted.
struct GroupBarrier {
    size: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl GroupBarrier {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(aborted());
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            self.cvar.wait(&mut state);
        }
        if state.generation == generation {
            return Err(aborted());
        }
        Ok(())
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.cvar.notify_all();
    }
}

fn aborted() -> PoissonError {
    PoissonError::Comm("worker group aborted".into())
}

struct Group {
    barrier: GroupBarrier,
    scalars: Mutex<Vec<f64>>,
    vectors: Mutex<Vec<Vec<f64>>>,
    /// Dropped on abort; every `abort_rx` then disconnects at once.
    abort_tx: Mutex<Option<Sender<()>>>,
}

impl Group {
    fn abort(&self) {
        self.abort_tx.lock().take();
        self.barrier.abort();
    }
}

/// One member of an in-process worker group.
///
/// Collectives go through shared slots bracketed by barriers; reductions
/// combine the slots in rank order so every member sees the same result.
/// Boundary rows travel over one channel per ordered pair of ranks.
pub struct ThreadComm {
    rank: usize,
    group: Arc<Group>,
    outboxes: Vec<Option<Sender<Vec<f64>>>>,
    inboxes: Vec<Option<Receiver<Vec<f64>>>>,
    abort_rx: Receiver<()>,
}

impl ThreadComm {
    /// Handles for a group of `size` workers, in rank order.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let (abort_tx, abort_rx) = crossbeam_channel::bounded(0);
        let group = Arc::new(Group {
            barrier: GroupBarrier::new(size),
            scalars: Mutex::new(vec![0.0; size]),
            vectors: Mutex::new(vec![Vec::new(); size]),
            abort_tx: Mutex::new(Some(abort_tx)),
        });

        let mut outboxes: Vec<Vec<Option<Sender<Vec<f64>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        let mut inboxes: Vec<Vec<Option<Receiver<Vec<f64>>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for from in 0..size {
            for to in 0..size {
                if from != to {
                    let (tx, rx) = crossbeam_channel::unbounded();
                    outboxes[from][to] = Some(tx);
                    inboxes[to][from] = Some(rx);
                }
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| ThreadComm {
                rank,
                group: Arc::clone(&group),
                outboxes,
                inboxes,
                abort_rx: abort_rx.clone(),
            })
            .collect()
    }
}

impl CommunicationBackend for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.group.barrier.size
    }

    fn all_reduce_max(&self, local: f64) -> Result<f64> {
        self.group.scalars.lock()[self.rank] = local;
        self.barrier()?;
        let global = self
            .group
            .scalars
            .lock()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, nan_max);
        // Nobody may overwrite a slot until everyone has read.
        self.barrier()?;
        Ok(global)
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) -> Result<()> {
        self.group.vectors.lock()[self.rank] = local.to_vec();
        self.barrier()?;
        {
            let vectors = self.group.vectors.lock();
            if let Some(bad) = vectors.iter().position(|v| v.len() != local.len()) {
                return Err(PoissonError::Comm(format!(
                    "rank {bad} contributed {} values, rank {} expected {}",
                    vectors[bad].len(),
                    self.rank,
                    local.len()
                )));
            }
            local.fill(0.0);
            for contribution in vectors.iter() {
                for (acc, v) in local.iter_mut().zip(contribution) {
                    *acc += v;
                }
            }
        }
        self.barrier()
    }

    fn send_recv(&self, peer: usize, send: &[f64], recv: &mut [f64]) -> Result<()> {
        let (Some(Some(outbox)), Some(Some(inbox))) = (self.outboxes.get(peer), self.inboxes.get(peer))
        else {
            return Err(PoissonError::Comm(format!(
                "rank {} has no channel to rank {peer}",
                self.rank
            )));
        };
        outbox
            .send(send.to_vec())
            .map_err(|_| PoissonError::Comm(format!("rank {peer} hung up")))?;
        let row = select! {
            recv(inbox) -> row => row.map_err(|_| PoissonError::Comm(format!("rank {peer} hung up")))?,
            recv(self.abort_rx) -> _ => return Err(aborted()),
        };
        if row.len() != recv.len() {
            return Err(PoissonError::Comm(format!(
                "rank {peer} sent {} values, expected {}",
                row.len(),
                recv.len()
            )));
        }
        recv.copy_from_slice(&row);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.group.barrier.wait()
    }

    fn abort(&self) {
        self.group.abort();
    }
}
