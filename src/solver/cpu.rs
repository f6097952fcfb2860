//! Host-memory backend.
//!
//! Each `CpuBackend` stands in for one device: fields live in host memory
//! behind a lock, kernels run on the rayon pool and complete before the launch
//! returns. Peers in the same process can read each other's fields directly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{PoissonError, Result};

use super::backend::{DeviceField, FieldId, PeerEnable, StencilBackend};
use super::kernel::{self, KernelVariant, StencilParams};

/// Field stored in host memory.
pub struct CpuField {
    id: FieldId,
    rows: usize,
    cols: usize,
    data: Arc<RwLock<Vec<f64>>>,
}

impl CpuField {
    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.data
            .read()
            .map_err(|_| PoissonError::Device(format!("field {} lock poisoned", self.id)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f64>>> {
        self.data
            .write()
            .map_err(|_| PoissonError::Device(format!("field {} lock poisoned", self.id)))
    }

    fn row_range(&self, row: usize, len: usize) -> Result<std::ops::Range<usize>> {
        if row >= self.rows || len != self.cols {
            return Err(PoissonError::Device(format!(
                "row {row} (len {len}) out of bounds for {}x{} field {}",
                self.rows, self.cols, self.id
            )));
        }
        Ok(row * self.cols..(row + 1) * self.cols)
    }
}

impl DeviceField for CpuField {
    fn id(&self) -> FieldId {
        self.id
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }
}

/// Read-only window onto a peer's `CpuField`.
#[derive(Clone)]
pub struct CpuPeerView {
    id: FieldId,
    rows: usize,
    cols: usize,
    data: Arc<RwLock<Vec<f64>>>,
}

/// Host-memory device.
pub struct CpuBackend {
    ordinal: usize,
    peer_capable: bool,
    enabled_peers: Mutex<HashSet<usize>>,
}

impl CpuBackend {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            peer_capable: true,
            enabled_peers: Mutex::new(HashSet::new()),
        }
    }

    /// A device that refuses peer access, forcing host-staged exchange.
    pub fn isolated(ordinal: usize) -> Self {
        Self {
            peer_capable: false,
            ..Self::new(ordinal)
        }
    }

    fn check_distinct(a: &CpuField, b: &CpuField, what: &str) -> Result<()> {
        if a.id == b.id {
            return Err(PoissonError::Device(format!(
                "{what}: both operands are field {}",
                a.id
            )));
        }
        Ok(())
    }

    fn check_shape(field: &CpuField, params: &StencilParams) -> Result<()> {
        if field.rows != params.rows() || field.cols != params.nx {
            return Err(PoissonError::Device(format!(
                "field {} is {}x{}, stencil expects {}x{}",
                field.id,
                field.rows,
                field.cols,
                params.rows(),
                params.nx
            )));
        }
        Ok(())
    }
}

impl StencilBackend for CpuBackend {
    type Field = CpuField;
    type PeerView = CpuPeerView;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> String {
        format!("cpu:{}", self.ordinal)
    }

    fn alloc_field(&self, rows: usize, cols: usize) -> Result<CpuField> {
        let len = rows.checked_mul(cols).ok_or_else(|| {
            PoissonError::Device(format!("field size {rows}x{cols} overflows"))
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            PoissonError::Device(format!("allocating {rows}x{cols} field on {}: {e}", self.name()))
        })?;
        data.resize(len, 0.0);
        Ok(CpuField {
            id: FieldId::next(),
            rows,
            cols,
            data: Arc::new(RwLock::new(data)),
        })
    }

    fn upload(&self, field: &CpuField, data: &[f64]) -> Result<()> {
        let mut guard = field.write()?;
        if guard.len() != data.len() {
            return Err(PoissonError::Device(format!(
                "upload of {} values into field {} of {}",
                data.len(),
                field.id,
                guard.len()
            )));
        }
        guard.copy_from_slice(data);
        Ok(())
    }

    fn download(&self, field: &CpuField, out: &mut [f64]) -> Result<()> {
        let guard = field.read()?;
        if guard.len() != out.len() {
            return Err(PoissonError::Device(format!(
                "download of field {} ({} values) into {}",
                field.id,
                guard.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&guard);
        Ok(())
    }

    fn read_row(&self, field: &CpuField, row: usize, out: &mut [f64]) -> Result<()> {
        let range = field.row_range(row, out.len())?;
        out.copy_from_slice(&field.read()?[range]);
        Ok(())
    }

    fn write_row(&self, field: &CpuField, row: usize, data: &[f64]) -> Result<()> {
        let range = field.row_range(row, data.len())?;
        field.write()?[range].copy_from_slice(data);
        Ok(())
    }

    fn launch_stencil(
        &self,
        variant: KernelVariant,
        out: &CpuField,
        prev: &CpuField,
        source: &CpuField,
        params: &StencilParams,
    ) -> Result<()> {
        Self::check_distinct(out, prev, "stencil launch")?;
        Self::check_distinct(out, source, "stencil launch")?;
        for field in [out, prev, source] {
            Self::check_shape(field, params)?;
        }
        let mut out = out.write()?;
        let prev = prev.read()?;
        let source = source.read()?;
        kernel::step(variant, &mut out, &prev, &source, params);
        Ok(())
    }

    fn apply_boundary(&self, field: &CpuField, params: &StencilParams) -> Result<()> {
        Self::check_shape(field, params)?;
        kernel::apply_boundary(&mut field.write()?, params);
        Ok(())
    }

    fn max_abs_diff(&self, a: &CpuField, b: &CpuField, params: &StencilParams) -> Result<f64> {
        Self::check_distinct(a, b, "convergence diff")?;
        Self::check_shape(a, params)?;
        Self::check_shape(b, params)?;
        Ok(kernel::max_abs_diff(&a.read()?, &b.read()?, params))
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn can_access_peer(&self, peer: &Self) -> bool {
        self.peer_capable && peer.peer_capable
    }

    fn enable_peer_access(&self, peer: &Self) -> Result<PeerEnable> {
        if !self.can_access_peer(peer) {
            return Err(PoissonError::Device(format!(
                "{} cannot access {}",
                self.name(),
                peer.name()
            )));
        }
        if peer.ordinal == self.ordinal {
            return Err(PoissonError::Device(format!(
                "{} cannot map its own memory as a peer",
                self.name()
            )));
        }
        let mut enabled = self
            .enabled_peers
            .lock()
            .map_err(|_| PoissonError::Device("peer table lock poisoned".into()))?;
        if enabled.insert(peer.ordinal) {
            Ok(PeerEnable::Enabled)
        } else {
            Ok(PeerEnable::AlreadyEnabled)
        }
    }

    fn export_peer(&self, field: &CpuField) -> Option<CpuPeerView> {
        self.peer_capable.then(|| CpuPeerView {
            id: field.id,
            rows: field.rows,
            cols: field.cols,
            data: Arc::clone(&field.data),
        })
    }

    fn copy_row_from_peer(
        &self,
        src: &CpuPeerView,
        src_row: usize,
        dst: &CpuField,
        dst_row: usize,
    ) -> Result<()> {
        if src_row >= src.rows || src.cols != dst.cols {
            return Err(PoissonError::Device(format!(
                "peer row {src_row} of field {} does not fit field {}",
                src.id, dst.id
            )));
        }
        let dst_range = dst.row_range(dst_row, src.cols)?;
        // Never hold a peer lock while taking our own: the peer may be copying
        // from us at the same time.
        let row = {
            let guard = src
                .data
                .read()
                .map_err(|_| PoissonError::Device(format!("peer field {} lock poisoned", src.id)))?;
            guard[src_row * src.cols..(src_row + 1) * src.cols].to_vec()
        };
        dst.write()?[dst_range].copy_from_slice(&row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Bounds, GlobalGrid};
    use crate::solver::partition::GridPartitioner;

    fn params(nx: usize, ny: usize) -> StencilParams {
        let grid = GlobalGrid::new(nx, ny, Bounds::default()).unwrap();
        let sub = GridPartitioner::subdomain(&grid, 1, 0).unwrap();
        StencilParams::new(&grid, &sub)
    }

    #[test]
    fn ordinal_and_name_follow_construction() {
        let dev = CpuBackend::isolated(3);
        assert_eq!(dev.ordinal(), 3);
        assert_eq!(dev.name(), "cpu:3");
    }

    #[test]
    fn fields_start_zeroed_with_unique_ids() {
        let dev = CpuBackend::new(0);
        let a = dev.alloc_field(4, 3).unwrap();
        let b = dev.alloc_field(4, 3).unwrap();
        assert_ne!(a.id(), b.id());
        let mut out = vec![1.0; 12];
        dev.download(&a, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn row_round_trip() {
        let dev = CpuBackend::new(0);
        let f = dev.alloc_field(3, 4).unwrap();
        dev.write_row(&f, 1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut row = vec![0.0; 4];
        dev.read_row(&f, 1, &mut row).unwrap();
        assert_eq!(row, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(dev.read_row(&f, 3, &mut row).is_err());
        assert!(dev.write_row(&f, 0, &[1.0]).is_err());
    }

    #[test]
    fn aliased_stencil_operands_are_rejected() {
        let dev = CpuBackend::new(0);
        let p = params(8, 8);
        let a = dev.alloc_field(p.rows(), p.nx).unwrap();
        let b = dev.alloc_field(p.rows(), p.nx).unwrap();
        assert!(dev.launch_stencil(KernelVariant::Reference, &a, &a, &b, &p).is_err());
        assert!(dev.max_abs_diff(&a, &a, &p).is_err());
        assert!(dev.launch_stencil(KernelVariant::Reference, &a, &b, &b, &p).is_ok());
    }

    #[test]
    fn shape_mismatch_is_a_device_error() {
        let dev = CpuBackend::new(0);
        let p = params(8, 8);
        let a = dev.alloc_field(p.rows(), p.nx).unwrap();
        let small = dev.alloc_field(2, p.nx).unwrap();
        let err = dev.max_abs_diff(&a, &small, &p).unwrap_err();
        assert!(matches!(err, PoissonError::Device(_)));
    }

    #[test]
    fn peer_enable_counts_repeat_as_success() {
        let d0 = CpuBackend::new(0);
        let d1 = CpuBackend::new(1);
        assert_eq!(d0.enable_peer_access(&d1).unwrap(), PeerEnable::Enabled);
        assert_eq!(d0.enable_peer_access(&d1).unwrap(), PeerEnable::AlreadyEnabled);
    }

    #[test]
    fn isolated_device_has_no_peer_path() {
        let d0 = CpuBackend::new(0);
        let d1 = CpuBackend::isolated(1);
        assert!(!d0.can_access_peer(&d1));
        assert!(d0.enable_peer_access(&d1).is_err());
        let f = d1.alloc_field(2, 2).unwrap();
        assert!(d1.export_peer(&f).is_none());
    }

    #[test]
    fn self_peering_fails() {
        let a = CpuBackend::new(3);
        let b = CpuBackend::new(3);
        assert!(a.can_access_peer(&b));
        assert!(a.enable_peer_access(&b).is_err());
    }

    #[test]
    fn peer_copy_reads_neighbour_memory() {
        let d0 = CpuBackend::new(0);
        let d1 = CpuBackend::new(1);
        let src = d0.alloc_field(3, 2).unwrap();
        d0.upload(&src, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let dst = d1.alloc_field(3, 2).unwrap();
        let view = d0.export_peer(&src).unwrap();
        d1.copy_row_from_peer(&view, 2, &dst, 0).unwrap();
        let mut out = vec![0.0; 6];
        d1.download(&dst, &mut out).unwrap();
        assert_eq!(out, vec![5.0, 6.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
