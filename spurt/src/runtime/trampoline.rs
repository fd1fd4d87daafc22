//! Native thunks, the data blocks they jump through, and the resolvers they start out pointing
//! at.
//!
//! A thunk is a few bytes of native code that loads the address of its data block into the third
//! argument register and jumps through the first word of that block. Every data block starts with
//! a [ThunkHead], so a thunk can be retargeted with a single atomic store, and whatever the thunk
//! jumps to receives the data block as its third argument.

use super::SpuFunction;
use crate::{
    analysis::FunctionKey, codebuf::ExecArena, compile::CompilationError, storage::GuestStorage,
    thread::SpuThread,
};
use std::{
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// The first field of every `#[repr(C)]` data block a thunk refers to.
#[derive(Debug)]
#[repr(C)]
pub struct ThunkHead {
    jump: AtomicUsize,
}

impl ThunkHead {
    pub fn new(f: SpuFunction) -> Self {
        Self {
            jump: AtomicUsize::new(f as usize),
        }
    }

    /// Make the thunk jump to `f` from now on.
    pub(crate) fn retarget(&self, f: SpuFunction) {
        self.jump.store(f as usize, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn jump(&self) -> usize {
        self.jump.load(Ordering::Acquire)
    }
}

/// A branch from compiled code to an address outside it. Initially jumps to [spu_branch], which
/// resolves `target` and then binds the patchpoint to the result.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Patchpoint {
    pub(crate) head: ThunkHead,
    pub(crate) target: u32,
}

/// The dispatch target of an address with more than one compiled function: [spu_select] walks
/// `tree` to pick the one matching the local storage.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct Switch {
    pub(crate) head: ThunkHead,
    pub(crate) entry: u32,
    pub(crate) tree: Workload,
}

/// Emit a thunk for the data block starting with `head`. `head` must outlive the thunk.
#[cfg(all(target_arch = "x86_64", not(windows)))]
pub(crate) fn emit_thunk(
    arena: &ExecArena,
    head: *const ThunkHead,
) -> Result<SpuFunction, CompilationError> {
    use dynasmrt::{dynasm, x64::X64Relocation, DynasmApi, VecAssembler};

    let mut asm = VecAssembler::<X64Relocation>::new(0);
    dynasm!(asm
        ; .arch x64
        ; mov rdx, QWORD head as i64
        ; jmp QWORD [rdx]
    );
    let code = asm
        .finalize()
        .map_err(|e| CompilationError::InternalError(format!("Assembling thunk: {e:?}")))?;
    let p = arena.alloc(&code)?;
    Ok(unsafe { std::mem::transmute::<*const u8, SpuFunction>(p) })
}

#[cfg(not(all(target_arch = "x86_64", not(windows))))]
pub(crate) fn emit_thunk(
    _arena: &ExecArena,
    _head: *const ThunkHead,
) -> Result<SpuFunction, CompilationError> {
    Err(CompilationError::General(
        "Thunks are only supported on x86_64 System V platforms".into(),
    ))
}

/// The initial value of every dispatch slot: resolve (analysing and compiling if necessary) the
/// thread's `pc` and run the result.
///
/// # Safety
///
/// `spu` must point to a live [SpuThread] that nothing else is accessing.
pub unsafe extern "C" fn spu_dispatch(spu: *mut SpuThread, ls: *mut u8, _rip: *const u8) {
    let f = {
        let spu = unsafe { &mut *spu };
        let pc = spu.pc;
        let SpuThread { jit, ls, .. } = &mut *spu;
        match jit.dispatch(&*ls, pc) {
            Ok(f) => f,
            Err(e) => {
                spu.fault(e);
                return;
            }
        }
    };
    unsafe { f(spu, ls, ptr::null()) }
}

/// The initial target of a [Patchpoint]: resolve the patchpoint's target, bind the patchpoint to
/// it, and run it.
///
/// # Safety
///
/// As [spu_dispatch]; `rip` must point to a [Patchpoint].
pub unsafe extern "C" fn spu_branch(spu: *mut SpuThread, ls: *mut u8, rip: *const u8) {
    let pp = unsafe { &*(rip as *const Patchpoint) };
    let f = {
        let spu = unsafe { &mut *spu };
        spu.pc = pp.target;
        let SpuThread { jit, ls, .. } = &mut *spu;
        match jit.dispatch(&*ls, pp.target) {
            Ok(f) => {
                // Bind to the slot rather than `f`: if several functions live at the target, the
                // slot is a switch that must keep choosing between them.
                let d = jit.runtime().dispatcher();
                if d.is_resolved(pp.target) {
                    pp.head.retarget(d.get(pp.target));
                }
                f
            }
            Err(e) => {
                spu.fault(e);
                return;
            }
        }
    };
    unsafe { f(spu, ls, ptr::null()) }
}

/// The code of a [Switch]: pick the function matching the local storage and run it.
///
/// # Safety
///
/// As [spu_dispatch]; `rip` must point to a [Switch].
pub unsafe extern "C" fn spu_select(spu: *mut SpuThread, ls: *mut u8, rip: *const u8) {
    let sw = unsafe { &*(rip as *const Switch) };
    let f = {
        let spu = unsafe { &mut *spu };
        spu.pc = sw.entry;
        sw.tree.select(&spu.ls, sw.entry)
    };
    unsafe { f(spu, ls, ptr::null()) }
}

/// A decision tree choosing between functions that share an entry address, by looking at the
/// local storage.
#[derive(Debug)]
pub(crate) enum Workload {
    Leaf(SpuFunction),
    /// If the word at `entry + 4 * level` is below `pivot` take `lo`, otherwise `hi`.
    Split {
        level: usize,
        pivot: u32,
        lo: Box<Workload>,
        hi: Box<Workload>,
    },
}

impl Workload {
    /// Build a tree for `cands`, which must be non-empty and sorted by key.
    pub(crate) fn build(cands: &[(FunctionKey, SpuFunction)]) -> Self {
        Self::build_from(cands.iter().collect(), 0)
    }

    fn build_from(cands: Vec<&(FunctionKey, SpuFunction)>, level: usize) -> Self {
        if cands.len() == 1 {
            return Workload::Leaf(cands[0].1);
        }
        let min_len = cands.iter().map(|(k, _)| k.len()).min().unwrap_or(0);
        for l in level..min_len {
            // Holes can't be told apart.
            if cands.iter().any(|(k, _)| k[l] == 0) {
                continue;
            }
            let mut sorted = cands.clone();
            sorted.sort_by_key(|(k, _)| k[l]);
            let min = sorted[0].0[l];
            if sorted[sorted.len() - 1].0[l] == min {
                continue;
            }
            let mut pivot = sorted[sorted.len() / 2].0[l];
            if pivot == min {
                // There are at least two distinct values, so this always finds one.
                pivot = sorted
                    .iter()
                    .map(|(k, _)| k[l])
                    .find(|v| *v > min)
                    .unwrap_or(pivot);
            }
            let (lo, hi): (Vec<_>, Vec<_>) = cands.into_iter().partition(|(k, _)| k[l] < pivot);
            return Workload::Split {
                level: l,
                pivot,
                lo: Box::new(Self::build_from(lo, l)),
                hi: Box::new(Self::build_from(hi, l)),
            };
        }
        // Nothing distinguishes the candidates: prefer the shortest key, then the lowest.
        let best = cands
            .iter()
            .min_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        match best {
            Some((_, f)) => Workload::Leaf(*f),
            None => Workload::Leaf(spu_dispatch),
        }
    }

    /// Pick the function for the code currently at `entry` in `ls`.
    pub(crate) fn select<S: GuestStorage + ?Sized>(&self, ls: &S, entry: u32) -> SpuFunction {
        let mut n = self;
        loop {
            match n {
                Workload::Leaf(f) => return *f,
                Workload::Split {
                    level,
                    pivot,
                    lo,
                    hi,
                } => {
                    let w = ls.word(entry.wrapping_add((*level as u32) << 2));
                    n = if w < *pivot { lo } else { hi };
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        match self {
            Workload::Leaf(_) => 0,
            Workload::Split { lo, hi, .. } => 1 + lo.depth().max(hi.depth()),
        }
    }
}
