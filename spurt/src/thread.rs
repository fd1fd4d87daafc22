//! A guest thread: the register state compiled code runs against, and the loop that jumps from
//! one compiled function to the next.

use crate::{
    isa::LS_MASK,
    recompiler::SpuRecompiler,
    runtime::{RuntimeError, SpuFunction, SpuRuntime},
    storage::LocalStorage,
};
use std::{ptr, sync::Arc};

/// Executes the instructions compiled code does not translate itself: everything except
/// control flow. `gpr` holds the preferred slot of each register.
pub trait InsnHandler: Send {
    fn execute(&mut self, gpr: &mut [u32; 128], ls: &mut LocalStorage, pos: u32, word: u32);
}

/// An [InsnHandler] that treats every instruction as a no-op.
pub struct IgnoreHandler;

impl InsnHandler for IgnoreHandler {
    fn execute(&mut self, _gpr: &mut [u32; 128], _ls: &mut LocalStorage, _pos: u32, _word: u32) {}
}

#[derive(Debug)]
pub enum ThreadState {
    Idle,
    Running,
    /// Executed `STOP` with the given code.
    Stopped(u32),
    /// Could not continue. The same error is returned by [SpuThread::run].
    Faulted(Arc<RuntimeError>),
}

pub struct SpuThread {
    pub pc: u32,
    pub gpr: [u32; 128],
    /// The return address of an interrupt, used by `IRET`.
    pub srr0: u32,
    pub ls: LocalStorage,
    state: ThreadState,
    /// Where to go after the current function returns, if compiled code knows better than the
    /// dispatch table.
    pub(crate) next: Option<SpuFunction>,
    pub(crate) jit: SpuRecompiler,
    pub(crate) handler: Box<dyn InsnHandler>,
}

impl SpuThread {
    pub fn new(rt: &Arc<SpuRuntime>, handler: Box<dyn InsnHandler>) -> Self {
        Self {
            pc: 0,
            gpr: [0; 128],
            srr0: 0,
            ls: LocalStorage::new(),
            state: ThreadState::Idle,
            next: None,
            jit: SpuRecompiler::new(Arc::clone(rt)),
            handler,
        }
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    /// Run from `pc` until the guest stops, returning the stop code. A fatal error leaves the
    /// thread [ThreadState::Faulted] and is also returned.
    pub fn run(&mut self) -> Result<u32, Arc<RuntimeError>> {
        self.jit.init();
        self.state = ThreadState::Running;
        self.next = None;
        loop {
            match &self.state {
                ThreadState::Running => (),
                ThreadState::Stopped(code) => return Ok(*code),
                ThreadState::Faulted(e) => return Err(Arc::clone(e)),
                ThreadState::Idle => unreachable!(),
            }
            self.pc &= LS_MASK;
            let f = match self.next.take() {
                Some(f) => f,
                None => self.jit.runtime().dispatcher().get(self.pc),
            };
            let ls = self.ls.as_mut_ptr();
            unsafe { f(self as *mut _, ls, ptr::null()) };
        }
    }

    /// Stop the thread because of `e`.
    pub(crate) fn fault(&mut self, e: RuntimeError) {
        self.next = None;
        self.state = ThreadState::Faulted(Arc::new(e));
    }

    /// Stop the thread because the `STOP` at `pos` executed.
    pub(crate) fn stop(&mut self, code: u32, pos: u32) {
        self.pc = (pos + 4) & LS_MASK;
        self.next = None;
        self.state = ThreadState::Stopped(code);
    }
}
