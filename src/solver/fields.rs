//! Per-worker device fields.

use super::backend::{DeviceField, StencilBackend};
use super::partition::{GridPartitioner, LocalSubdomain};
use crate::error::Result;
use crate::grid::GlobalGrid;

/// Two-slot buffer holding the current and previous iterate.
///
/// `advance` flips the index flag; no data moves. The two slots are always
/// distinct allocations.
pub struct DoubleBuffer<F> {
    slots: [F; 2],
    current: usize,
}

impl<F: DeviceField> DoubleBuffer<F> {
    pub fn new(a: F, b: F) -> Self {
        Self {
            slots: [a, b],
            current: 0,
        }
    }

    /// Slot holding the latest iterate.
    pub fn current(&self) -> &F {
        &self.slots[self.current]
    }

    /// Slot holding the iterate before the latest one.
    pub fn previous(&self) -> &F {
        &self.slots[1 - self.current]
    }

    pub fn slot_index(&self) -> usize {
        self.current
    }

    /// Make the previous slot current.
    pub fn advance(&mut self) {
        self.current = 1 - self.current;
    }

    pub fn slots(&self) -> &[F; 2] {
        &self.slots
    }
}

/// The (p, pd, b) arrays one worker owns for the whole solve.
pub struct FieldSet<F> {
    pub pair: DoubleBuffer<F>,
    pub source: F,
}

impl<F: DeviceField> FieldSet<F> {
    /// Allocate zeroed iterates and upload the local source term.
    pub fn allocate<B>(backend: &B, grid: &GlobalGrid, sub: &LocalSubdomain) -> Result<Self>
    where
        B: StencilBackend<Field = F>,
    {
        let (rows, cols) = (sub.local_rows(), sub.nx);
        let pair = DoubleBuffer::new(backend.alloc_field(rows, cols)?, backend.alloc_field(rows, cols)?);
        let source = backend.alloc_field(rows, cols)?;
        backend.upload(&source, &GridPartitioner::source_field(grid, sub))?;
        Ok(Self { pair, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Bounds;
    use crate::solver::cpu::CpuBackend;

    #[test]
    fn slots_never_alias() {
        let dev = CpuBackend::new(0);
        let mut pair = DoubleBuffer::new(dev.alloc_field(3, 3).unwrap(), dev.alloc_field(3, 3).unwrap());
        for _ in 0..5 {
            assert_ne!(pair.current().id(), pair.previous().id());
            pair.advance();
        }
    }

    #[test]
    fn advance_flips_the_index() {
        let dev = CpuBackend::new(0);
        let mut pair = DoubleBuffer::new(dev.alloc_field(3, 3).unwrap(), dev.alloc_field(3, 3).unwrap());
        let first = pair.current().id();
        pair.advance();
        assert_eq!(pair.slot_index(), 1);
        assert_eq!(pair.previous().id(), first);
        pair.advance();
        assert_eq!(pair.current().id(), first);
    }

    #[test]
    fn field_set_carries_local_sources() {
        let grid = GlobalGrid::new(20, 20, Bounds::default()).unwrap();
        let sub = GridPartitioner::subdomain(&grid, 1, 0).unwrap();
        let dev = CpuBackend::new(0);
        let set = FieldSet::allocate(&dev, &grid, &sub).unwrap();
        let mut b = vec![0.0; sub.local_len()];
        dev.download(&set.source, &mut b).unwrap();
        // Sources at global (5, 5) and (15, 15).
        assert_eq!(b[6 * sub.nx + 5], 100.0);
        assert_eq!(b[16 * sub.nx + 15], -100.0);
    }
}
