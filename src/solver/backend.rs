//! Device abstraction for the per-worker stencil solve.
//!
//! A `StencilBackend` owns one device (a host memory arena or a wgpu adapter)
//! and the fields allocated on it. The driver and the halo exchanger only talk
//! to devices through this trait, so the tiled and reference kernels, and the
//! host and accelerator backends, all sit behind one contract.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

use super::kernel::{KernelVariant, StencilParams};

/// Process-unique identity of an allocated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u64);

impl FieldId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A device-resident `rows x cols` array.
pub trait DeviceField {
    fn id(&self) -> FieldId;
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
}

/// Outcome of a successful peer-access enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEnable {
    Enabled,
    AlreadyEnabled,
}

/// One accelerator bound to one worker.
///
/// Launches may be asynchronous; `synchronize` blocks until all submitted
/// work has completed. Row reads and writes are ordered after previously
/// submitted work on the same device.
pub trait StencilBackend: Send {
    type Field: DeviceField + Send;
    /// Read-only handle through which a peer device can copy from a field.
    type PeerView: Send;

    /// Device ordinal this backend is bound to.
    fn ordinal(&self) -> usize;

    /// Human-readable device name.
    fn name(&self) -> String;

    /// Allocate a zero-initialised field.
    fn alloc_field(&self, rows: usize, cols: usize) -> Result<Self::Field>;

    /// Overwrite a whole field from host memory.
    fn upload(&self, field: &Self::Field, data: &[f64]) -> Result<()>;

    /// Copy a whole field to host memory.
    fn download(&self, field: &Self::Field, out: &mut [f64]) -> Result<()>;

    /// Copy one row to host memory.
    fn read_row(&self, field: &Self::Field, row: usize, out: &mut [f64]) -> Result<()>;

    /// Overwrite one row from host memory.
    fn write_row(&self, field: &Self::Field, row: usize, data: &[f64]) -> Result<()>;

    /// `out = stencil(prev, source)` on every updated cell. `out` and `prev`
    /// must be distinct fields.
    fn launch_stencil(
        &self,
        variant: KernelVariant,
        out: &Self::Field,
        prev: &Self::Field,
        source: &Self::Field,
        params: &StencilParams,
    ) -> Result<()>;

    /// Force side columns and owned global edge rows to zero.
    fn apply_boundary(&self, field: &Self::Field, params: &StencilParams) -> Result<()>;

    /// Largest `|a - b|` over owned rows. `a` and `b` must be distinct fields.
    fn max_abs_diff(&self, a: &Self::Field, b: &Self::Field, params: &StencilParams) -> Result<f64>;

    /// Block until all submitted work has completed.
    fn synchronize(&self) -> Result<()>;

    /// Whether this device can read `peer`'s memory directly.
    fn can_access_peer(&self, peer: &Self) -> bool;

    /// Map `peer`'s memory into this device's address space.
    fn enable_peer_access(&self, peer: &Self) -> Result<PeerEnable>;

    /// Handle a peer can copy from, or `None` if the device cannot export memory.
    fn export_peer(&self, field: &Self::Field) -> Option<Self::PeerView>;

    /// Copy `src_row` of a peer's field straight into `dst_row` of a local field.
    fn copy_row_from_peer(
        &self,
        src: &Self::PeerView,
        src_row: usize,
        dst: &Self::Field,
        dst_row: usize,
    ) -> Result<()>;
}
