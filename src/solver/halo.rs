//! Halo exchange between adjacent row blocks.
//!
//! After every local update, worker `r` receives the last owned row of
//! `r - 1` into its top halo and the first owned row of `r + 1` into its
//! bottom halo. Each adjacency uses one of two paths:
//!
//! - **Direct**: the worker copies the neighbour's row device-to-device
//!   through a read-only peer mapping. Workers only ever write their own
//!   halos, and a group barrier before the copies guarantees every
//!   neighbour's step has completed.
//! - **Host-staged**: the worker reads its boundary row into a host buffer,
//!   swaps it with the neighbour through the process group, and writes the
//!   received row into its halo. Exchanges run upper neighbour first, then
//!   lower, so the chain of combined send-receives is acyclic.
//!
//! Both paths move the same values, so the solution does not depend on which
//! one an adjacency uses.

use crate::config::ExchangePolicy;
use crate::error::Result;

use super::backend::{PeerEnable, StencilBackend};
use super::comm::CommunicationBackend;
use super::fields::DoubleBuffer;
use super::partition::LocalSubdomain;

/// Which adjacencies may use direct device-to-device copies.
///
/// `links[r]` covers the adjacency between ranks `r` and `r + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTopology {
    links: Vec<bool>,
}

impl PeerTopology {
    /// Every adjacency host-staged.
    pub fn host_staged(workers: usize) -> Self {
        Self {
            links: vec![false; workers.saturating_sub(1)],
        }
    }

    /// Whether ranks `upper` and `upper + 1` copy directly.
    pub fn is_direct(&self, upper: usize) -> bool {
        self.links.get(upper).copied().unwrap_or(false)
    }

    pub(crate) fn mark_direct(&mut self, upper: usize) {
        if let Some(link) = self.links.get_mut(upper) {
            *link = true;
        }
    }

    pub fn any_direct(&self) -> bool {
        self.links.iter().any(|&d| d)
    }

    pub fn direct_links(&self) -> usize {
        self.links.iter().filter(|&&d| d).count()
    }

    pub fn staged_links(&self) -> usize {
        self.links.len() - self.direct_links()
    }
}

/// Enable peer access between every pair of adjacent devices.
///
/// An adjacency whose devices cannot reach each other is host-staged. Any
/// enable failure other than "already enabled" turns peer mode off for the
/// whole run; it is not retried.
pub fn negotiate_peer_access<B: StencilBackend>(devices: &[B], policy: ExchangePolicy) -> PeerTopology {
    let mut topology = PeerTopology::host_staged(devices.len());
    if policy == ExchangePolicy::HostStaged {
        tracing::info!("host-staged halo exchange requested");
        return topology;
    }

    let mut unreachable = Vec::new();
    for (r, pair) in devices.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        if !(a.can_access_peer(b) && b.can_access_peer(a)) {
            unreachable.push((a.name(), b.name()));
            continue;
        }
        let enabled = a
            .enable_peer_access(b)
            .and_then(|first| b.enable_peer_access(a).map(|second| (first, second)));
        match enabled {
            Ok((first, second)) => {
                tracing::debug!(
                    upper = %a.name(),
                    lower = %b.name(),
                    already = first == PeerEnable::AlreadyEnabled && second == PeerEnable::AlreadyEnabled,
                    "peer access enabled"
                );
                topology.mark_direct(r);
            }
            Err(e) => {
                tracing::warn!(
                    upper = %a.name(),
                    lower = %b.name(),
                    error = %e,
                    "enabling peer access failed, host-staged exchange for the whole run"
                );
                return PeerTopology::host_staged(devices.len());
            }
        }
    }

    if !unreachable.is_empty() {
        tracing::info!(
            adjacencies = unreachable.len(),
            first = ?unreachable[0],
            "peer access unavailable, those adjacencies use host-staged exchange"
        );
    }
    topology
}

/// Host staging buffers for one boundary row.
pub struct HaloBuffer {
    pub send: Vec<f64>,
    pub recv: Vec<f64>,
}

impl HaloBuffer {
    pub fn new(nx: usize) -> Self {
        Self {
            send: vec![0.0; nx],
            recv: vec![0.0; nx],
        }
    }
}

/// How one adjacency moves rows. `Direct` holds views of the neighbour's two
/// slots, indexed like the local `DoubleBuffer`.
pub enum LinkPath<V> {
    Direct([V; 2]),
    HostStaged,
}

pub struct HaloLink<V> {
    pub peer: usize,
    pub path: LinkPath<V>,
}

impl<V> HaloLink<V> {
    pub fn host_staged(peer: usize) -> Self {
        Self {
            peer,
            path: LinkPath::HostStaged,
        }
    }
}

/// One worker's side of the halo exchange.
pub struct HaloExchanger<V> {
    up: Option<HaloLink<V>>,
    down: Option<HaloLink<V>>,
    staging: HaloBuffer,
    /// Whether any adjacency in the group is direct. Must agree on every rank.
    group_has_direct: bool,
    pub peer_rows: u64,
    pub staged_rows: u64,
}

impl<V> HaloExchanger<V> {
    pub fn new(
        sub: &LocalSubdomain,
        up: Option<HaloLink<V>>,
        down: Option<HaloLink<V>>,
        group_has_direct: bool,
    ) -> Self {
        Self {
            up,
            down,
            staging: HaloBuffer::new(sub.nx),
            group_has_direct,
            peer_rows: 0,
            staged_rows: 0,
        }
    }

    /// Exchanger with every existing neighbour host-staged.
    pub fn host_staged(sub: &LocalSubdomain) -> Self {
        Self::new(
            sub,
            sub.upper_neighbor().map(HaloLink::host_staged),
            sub.lower_neighbor().map(HaloLink::host_staged),
            false,
        )
    }

    /// Refresh both halo rows of the current slot.
    ///
    /// Every rank of the group must call this once per iteration, after its
    /// step has been synchronized.
    pub fn exchange<B>(
        &mut self,
        backend: &B,
        sub: &LocalSubdomain,
        pair: &DoubleBuffer<B::Field>,
        comm: &dyn CommunicationBackend,
    ) -> Result<()>
    where
        B: StencilBackend<PeerView = V>,
    {
        if sub.num_ranks == 1 {
            return Ok(());
        }
        if self.group_has_direct {
            comm.barrier()?;
        }
        let slot = pair.slot_index();
        let current = pair.current();

        if let Some(link) = &self.up {
            match &link.path {
                // Neighbour blocks have the same height, so its last owned row is local_ny.
                LinkPath::Direct(views) => {
                    backend.copy_row_from_peer(&views[slot], sub.last_owned(), current, sub.halo_top())?;
                    self.peer_rows += 1;
                }
                LinkPath::HostStaged => {
                    backend.read_row(current, sub.first_owned(), &mut self.staging.send)?;
                    comm.send_recv(link.peer, &self.staging.send, &mut self.staging.recv)?;
                    backend.write_row(current, sub.halo_top(), &self.staging.recv)?;
                    self.staged_rows += 1;
                }
            }
        }

        if let Some(link) = &self.down {
            match &link.path {
                LinkPath::Direct(views) => {
                    backend.copy_row_from_peer(&views[slot], sub.first_owned(), current, sub.halo_bottom())?;
                    self.peer_rows += 1;
                }
                LinkPath::HostStaged => {
                    backend.read_row(current, sub.last_owned(), &mut self.staging.send)?;
                    comm.send_recv(link.peer, &self.staging.send, &mut self.staging.recv)?;
                    backend.write_row(current, sub.halo_bottom(), &self.staging.recv)?;
                    self.staged_rows += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Bounds, GlobalGrid};
    use crate::solver::backend::DeviceField;
    use crate::solver::comm::ThreadComm;
    use crate::solver::cpu::CpuBackend;
    use crate::solver::partition::GridPartitioner;

    #[test]
    fn all_capable_devices_link_directly() {
        let devices: Vec<_> = (0..4).map(CpuBackend::new).collect();
        let topology = negotiate_peer_access(&devices, ExchangePolicy::PreferPeer);
        assert_eq!(topology.direct_links(), 3);
        assert!(topology.any_direct());
    }

    #[test]
    fn isolated_device_stages_its_adjacencies() {
        let devices = vec![CpuBackend::new(0), CpuBackend::isolated(1), CpuBackend::new(2), CpuBackend::new(3)];
        let topology = negotiate_peer_access(&devices, ExchangePolicy::PreferPeer);
        assert!(!topology.is_direct(0));
        assert!(!topology.is_direct(1));
        assert!(topology.is_direct(2));
        assert_eq!(topology.staged_links(), 2);
    }

    #[test]
    fn enable_failure_disables_peer_mode_everywhere() {
        // Same ordinal twice: self-peering fails.
        let devices = vec![CpuBackend::new(0), CpuBackend::new(1), CpuBackend::new(1)];
        let topology = negotiate_peer_access(&devices, ExchangePolicy::PreferPeer);
        assert!(!topology.any_direct());
    }

    #[test]
    fn repeated_negotiation_accepts_already_enabled() {
        let devices: Vec<_> = (0..2).map(CpuBackend::new).collect();
        negotiate_peer_access(&devices, ExchangePolicy::PreferPeer);
        let again = negotiate_peer_access(&devices, ExchangePolicy::PreferPeer);
        assert!(again.is_direct(0));
    }

    #[test]
    fn host_staged_policy_skips_negotiation() {
        let devices: Vec<_> = (0..3).map(CpuBackend::new).collect();
        let topology = negotiate_peer_access(&devices, ExchangePolicy::HostStaged);
        assert_eq!(topology, PeerTopology::host_staged(3));
    }

    /// Two workers with owned rows filled with `rank + 1`; returns each
    /// worker's (top halo, bottom halo) after one exchange.
    fn exchange_once(direct: bool) -> Vec<(Vec<f64>, Vec<f64>)> {
        let grid = GlobalGrid::new(6, 8, Bounds::default()).unwrap();
        let subs = GridPartitioner::partition(&grid, 2).unwrap();
        let devices: Vec<_> = (0..2).map(CpuBackend::new).collect();
        let pairs: Vec<_> = devices
            .iter()
            .zip(&subs)
            .map(|(dev, sub)| {
                let a = dev.alloc_field(sub.local_rows(), sub.nx).unwrap();
                let b = dev.alloc_field(sub.local_rows(), sub.nx).unwrap();
                let mut host = vec![0.0; sub.local_len()];
                host[sub.nx..(sub.local_ny + 1) * sub.nx].fill(sub.rank as f64 + 1.0);
                dev.upload(&a, &host).unwrap();
                DoubleBuffer::new(a, b)
            })
            .collect();

        let views = |r: usize| {
            let slots = pairs[r].slots();
            [devices[r].export_peer(&slots[0]).unwrap(), devices[r].export_peer(&slots[1]).unwrap()]
        };
        let link = |peer: usize| {
            if direct {
                HaloLink { peer, path: LinkPath::Direct(views(peer)) }
            } else {
                HaloLink::host_staged(peer)
            }
        };
        let mut exchangers = vec![
            HaloExchanger::new(&subs[0], None, Some(link(1)), direct),
            HaloExchanger::new(&subs[1], Some(link(0)), None, direct),
        ];
        let comms = ThreadComm::group(2);

        std::thread::scope(|s| {
            for (((ex, comm), dev), (sub, pair)) in exchangers
                .iter_mut()
                .zip(&comms)
                .zip(&devices)
                .zip(subs.iter().zip(&pairs))
            {
                s.spawn(move || ex.exchange(dev, sub, pair, comm).unwrap());
            }
        });

        for ex in &exchangers {
            assert_eq!(ex.peer_rows + ex.staged_rows, 1);
            assert_eq!(ex.peer_rows == 1, direct);
        }

        devices
            .iter()
            .zip(&subs)
            .zip(&pairs)
            .map(|((dev, sub), pair)| {
                let mut top = vec![0.0; sub.nx];
                let mut bottom = vec![0.0; sub.nx];
                dev.read_row(pair.current(), sub.halo_top(), &mut top).unwrap();
                dev.read_row(pair.current(), sub.halo_bottom(), &mut bottom).unwrap();
                assert_eq!(pair.current().cols(), sub.nx);
                (top, bottom)
            })
            .collect()
    }

    #[test]
    fn both_paths_fill_halos_identically() {
        for direct in [false, true] {
            let halos = exchange_once(direct);
            // Rank 0: no upper neighbour, bottom halo from rank 1.
            assert!(halos[0].0.iter().all(|&v| v == 0.0));
            assert!(halos[0].1.iter().all(|&v| v == 2.0));
            // Rank 1: top halo from rank 0, no lower neighbour.
            assert!(halos[1].0.iter().all(|&v| v == 1.0));
            assert!(halos[1].1.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn single_worker_exchange_is_a_noop() {
        let grid = GlobalGrid::new(6, 6, Bounds::default()).unwrap();
        let sub = GridPartitioner::subdomain(&grid, 1, 0).unwrap();
        let dev = CpuBackend::new(0);
        let pair = DoubleBuffer::new(dev.alloc_field(8, 6).unwrap(), dev.alloc_field(8, 6).unwrap());
        let mut ex = HaloExchanger::<<CpuBackend as StencilBackend>::PeerView>::host_staged(&sub);
        ex.exchange(&dev, &sub, &pair, &crate::solver::comm::SingleProcessComm).unwrap();
        assert_eq!(ex.peer_rows + ex.staged_rows, 0);
    }
}
