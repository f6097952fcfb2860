//! MPI process group.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use mpi::collective::SystemOperation;
use mpi::point_to_point::send_receive_into;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::comm::CommunicationBackend;
use crate::error::{PoissonError, Result};

/// MPI-based process group over the world communicator.
pub struct MpiComm;

impl MpiComm {
    /// Panics inside MPI if `mpi::initialize()` has not been called.
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl CommunicationBackend for MpiComm {
    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }

    fn all_reduce_max(&self, local: f64) -> Result<f64> {
        let world = SimpleCommunicator::world();
        // MPI_MAX has no defined NaN behaviour.
        let local = if local.is_nan() { f64::INFINITY } else { local };
        let mut global = 0.0f64;
        world.all_reduce_into(&local, &mut global, SystemOperation::max());
        Ok(global)
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) -> Result<()> {
        let world = SimpleCommunicator::world();
        let send = local.to_vec();
        world.all_reduce_into(&send[..], local, SystemOperation::sum());
        Ok(())
    }

    fn send_recv(&self, peer: usize, send: &[f64], recv: &mut [f64]) -> Result<()> {
        let world = SimpleCommunicator::world();
        if peer >= world.size() as usize || peer == world.rank() as usize {
            return Err(PoissonError::Comm(format!(
                "rank {} cannot exchange with rank {peer}",
                world.rank()
            )));
        }
        let other = world.process_at_rank(peer as i32);
        let status = send_receive_into(send, &other, recv, &other);
        let received = status.count(f64::equivalent_datatype()) as usize;
        if received != recv.len() {
            return Err(PoissonError::Comm(format!(
                "rank {peer} sent {received} values, expected {}",
                recv.len()
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        SimpleCommunicator::world().barrier();
        Ok(())
    }

    fn abort(&self) {
        SimpleCommunicator::world().abort(1)
    }
}
