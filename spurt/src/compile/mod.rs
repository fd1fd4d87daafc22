use crate::{
    analysis::{Analyser, Function, FunctionKey},
    isa::LS_MASK,
    runtime::{SpuFunction, SpuRuntime, ThunkHead},
    thread::SpuThread,
};
use std::{collections::HashMap, env, error::Error, fmt, sync::Arc};
use thiserror::Error;

pub mod jitc_asm;
pub mod jitc_ir;

/// A failure to compile a function.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed for reasons that might be of interest to an embedder but not to the
    /// end user running a program.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in spurt.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. a function too large for the backend).
    LimitExceeded(String),
    #[error("Resource exhausted: {0}")]
    /// Compilation failed because an external resource (e.g. executable memory) was exhausted:
    /// the end user probably wants to be informed of this.
    ResourceExhausted(Box<dyn Error + Send + Sync>),
    #[error("No code at {0:#07x}")]
    /// Analysis found no executable words at the requested entry.
    EmptyFunction(u32),
}

/// The backends that can be selected with `SPURT_JITC`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CompilerKind {
    /// The baseline compiler: one operation per guest word.
    #[default]
    Asm,
    /// The optimising compiler: an IR of basic blocks.
    Ir,
}

impl CompilerKind {
    pub fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "asm" => Ok(Self::Asm),
            "ir" => Ok(Self::Ir),
            _ => Err(format!("Invalid SPURT_JITC value: {s}").into()),
        }
    }
}

/// The trait that every compiler backend must implement.
pub trait Compiler: Send + Sync {
    /// A short name for this compiler, used in logs.
    fn name(&self) -> &'static str;

    /// Compile `func`. `analysis` holds the analysis tables that produced `func`. Exits from the
    /// function must go through patchpoints created by `rt`.
    fn compile(
        &self,
        rt: &SpuRuntime,
        func: &Function,
        analysis: &Analyser,
    ) -> Result<Arc<dyn CompiledFunction>, CompilationError>;
}

pub fn compiler_for(kind: CompilerKind) -> Arc<dyn Compiler> {
    match kind {
        CompilerKind::Asm => Arc::new(jitc_asm::AsmCompiler),
        CompilerKind::Ir => Arc::new(jitc_ir::IrCompiler),
    }
}

/// Return the compiler requested by `SPURT_JITC` (`asm` if unset).
pub fn default_compiler() -> Result<Arc<dyn Compiler>, Box<dyn Error>> {
    match env::var("SPURT_JITC") {
        Ok(s) => Ok(compiler_for(CompilerKind::from_str(&s)?)),
        Err(_) => Ok(compiler_for(CompilerKind::default())),
    }
}

pub trait CompiledFunction: fmt::Debug + Send + Sync {
    /// The native entry point of this function.
    fn entry(&self) -> SpuFunction;

    /// The content this function was compiled from.
    fn key(&self) -> &FunctionKey;

    /// The other positions this function can be entered at, as byte offsets from its entry,
    /// each with the native code entering it there.
    fn inner_entries(&self) -> &[(u32, SpuFunction)] {
        &[]
    }

    /// Upcast this [CompiledFunction] to `Any`. This method is a hack that's only needed since
    /// trait upcasting in Rust is incomplete.
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync + 'static>;
}

/// The position of the word `off` bytes into a function that is running at `base`.
#[inline]
pub(crate) fn at(base: u32, off: u32) -> u32 {
    base.wrapping_add(off) & LS_MASK
}

/// A way out of a compiled function.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Exit {
    /// The target address when the function runs at the address it was compiled for.
    target: u32,
    /// Is `target` relative to the function's address (i.e. should it move if the same function
    /// runs elsewhere)?
    relative: bool,
    /// The branch patchpoint for `target`.
    patchpoint: SpuFunction,
}

impl Exit {
    /// Leave a function compiled at `entry` but running at `base`.
    pub(crate) fn take(&self, spu: &mut SpuThread, entry: u32, base: u32) {
        if base == entry {
            spu.pc = self.target;
            spu.next = Some(self.patchpoint);
        } else {
            // Patchpoints are bound to absolute addresses, so a moved function goes through the
            // dispatch table instead.
            spu.pc = if self.relative {
                at(base, self.target.wrapping_sub(entry))
            } else {
                self.target
            };
            spu.next = None;
        }
    }

    pub(crate) fn target(&self) -> u32 {
        self.target
    }
}

/// Where a branch in a compiled function goes.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Target {
    /// An index into the compiled function's body.
    Local(usize),
    Exit(Exit),
}

/// Creates [Exit]s for one function, sharing a patchpoint between exits to the same address.
pub(crate) struct Exits<'a> {
    rt: &'a SpuRuntime,
    patchpoints: HashMap<u32, SpuFunction>,
}

impl<'a> Exits<'a> {
    pub(crate) fn new(rt: &'a SpuRuntime) -> Self {
        Self {
            rt,
            patchpoints: HashMap::new(),
        }
    }

    pub(crate) fn exit(&mut self, target: u32, relative: bool) -> Result<Exit, CompilationError> {
        let patchpoint = match self.patchpoints.get(&target) {
            Some(x) => *x,
            None => {
                let x = self.rt.make_branch_patchpoint(target)?;
                self.patchpoints.insert(target, x);
                x
            }
        };
        Ok(Exit {
            target,
            relative,
            patchpoint,
        })
    }
}

/// The data block of a thunk entering the body `B` part way through.
#[derive(Debug)]
#[repr(C)]
pub(crate) struct InnerEntry<B> {
    head: ThunkHead,
    body: *const B,
    /// The entry's byte offset from the start of the function.
    pub(crate) off: u32,
    /// Where in the body execution starts (an op or block index, depending on the backend).
    pub(crate) start: usize,
}

// The body is owned by the same compiled function as the entry and is immutable.
unsafe impl<B: Sync> Send for InnerEntry<B> {}
unsafe impl<B: Sync> Sync for InnerEntry<B> {}

impl<B> InnerEntry<B> {
    /// # Safety
    ///
    /// The body this entry was created for must still be alive.
    pub(crate) unsafe fn body(&self) -> &B {
        unsafe { &*self.body }
    }
}

/// The inner entries of one compiled function.
#[derive(Debug)]
pub(crate) struct InnerEntries<B> {
    blocks: Vec<Box<InnerEntry<B>>>,
    code: Vec<(u32, SpuFunction)>,
}

impl<B> InnerEntries<B> {
    /// Create a thunk running `exec` for every entry point of `analysis` other than the
    /// function's own entry. `start_of` maps an entry's byte offset to where `exec` should start
    /// in `body`; entries it returns `None` for are not exposed.
    pub(crate) fn new(
        rt: &SpuRuntime,
        analysis: &Analyser,
        body: &B,
        exec: SpuFunction,
        start_of: impl Fn(u32) -> Option<usize>,
    ) -> Result<Self, CompilationError> {
        let entry = analysis.entry();
        let mut blocks = Vec::new();
        let mut code = Vec::new();
        for pos in analysis.entries() {
            if pos == entry || !analysis.is_code(pos) {
                continue;
            }
            let off = pos - entry;
            let Some(start) = start_of(off) else {
                continue;
            };
            let e = Box::new(InnerEntry {
                head: ThunkHead::new(exec),
                body: body as *const B,
                off,
                start,
            });
            code.push((off, rt.make_thunk(&e.head)?));
            blocks.push(e);
        }
        Ok(Self { blocks, code })
    }

    pub(crate) fn code(&self) -> &[(u32, SpuFunction)] {
        &self.code
    }

    #[cfg(test)]
    pub(crate) fn starts(&self) -> Vec<(u32, usize)> {
        self.blocks.iter().map(|e| (e.off, e.start)).collect()
    }
}

/// Called when a compiled function is entered but the local storage no longer holds the code it
/// was compiled from: rediscover the function at the current `pc` and continue there.
pub(crate) fn fall_back(spu: &mut SpuThread) {
    let pc = spu.pc;
    let SpuThread { jit, ls, .. } = &mut *spu;
    match jit.resolve(&*ls, pc) {
        Ok(f) => spu.next = Some(f),
        Err(e) => spu.fault(e),
    }
}

#[cfg(test)]
pub(crate) use compiler_testing::*;

#[cfg(test)]
mod compiler_testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A [Compiler] which counts how often it is invoked and then delegates to another compiler,
    /// optionally sleeping first so that other threads can pile up behind it.
    pub(crate) struct CountingCompiler {
        inner: Arc<dyn Compiler>,
        pub(crate) count: AtomicUsize,
        delay: std::time::Duration,
    }

    impl CountingCompiler {
        pub(crate) fn new(kind: CompilerKind) -> Arc<Self> {
            Self::with_delay(kind, std::time::Duration::ZERO)
        }

        pub(crate) fn with_delay(kind: CompilerKind, delay: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: compiler_for(kind),
                count: AtomicUsize::new(0),
                delay,
            })
        }

        pub(crate) fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Compiler for CountingCompiler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn compile(
            &self,
            rt: &SpuRuntime,
            func: &Function,
            analysis: &Analyser,
        ) -> Result<Arc<dyn CompiledFunction>, CompilationError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.compile(rt, func, analysis)
        }
    }

    /// A [Compiler] that always fails.
    pub(crate) struct FailingCompiler {
        pub(crate) count: AtomicUsize,
    }

    impl Compiler for FailingCompiler {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn compile(
            &self,
            _rt: &SpuRuntime,
            _func: &Function,
            _analysis: &Analyser,
        ) -> Result<Arc<dyn CompiledFunction>, CompilationError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Err(CompilationError::General("refusing to compile".into()))
        }
    }
}
