//! The dispatch table: one native entry point per instruction position in the local storage.

use super::{trampoline::spu_dispatch, SpuFunction};
use crate::isa::{LS_MASK, LS_WORDS};
use static_assertions::assert_eq_size;
use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

assert_eq_size!(usize, SpuFunction);

/// Every slot always holds a valid [SpuFunction]: initially [spu_dispatch], which resolves the
/// address it was called for. Slots are only ever read and written with single atomic operations,
/// so guest threads can jump through them while other threads update them.
pub struct DispatchTable {
    slots: Box<[AtomicUsize]>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..LS_WORDS)
                .map(|_| AtomicUsize::new(spu_dispatch as usize))
                .collect(),
        }
    }

    fn slot(&self, addr: u32) -> &AtomicUsize {
        &self.slots[((addr & LS_MASK) >> 2) as usize]
    }

    /// The entry point for `addr`.
    pub fn get(&self, addr: u32) -> SpuFunction {
        let p = self.slot(addr).load(Ordering::Acquire);
        // Safe because every value stored in a slot came from a `SpuFunction`.
        unsafe { mem::transmute::<usize, SpuFunction>(p) }
    }

    /// Point `addr` at `f`.
    pub fn set(&self, addr: u32, f: SpuFunction) {
        self.slot(addr).store(f as usize, Ordering::Release);
    }

    /// Has `addr` been bound to compiled code?
    pub fn is_resolved(&self, addr: u32) -> bool {
        self.slot(addr).load(Ordering::Acquire) != spu_dispatch as usize
    }
}
