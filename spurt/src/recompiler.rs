//! The per-thread recompiler: owns the analysis scratch tables and drives a function from
//! discovery through compilation into the shared [SpuRuntime].

use crate::{
    analysis::{Analyser, Function},
    compile::{compiler_for, Compiler, CompilerKind},
    isa::{LNOP, LS_MASK, LS_WORDS},
    log::{
        log_ir, should_log_ir,
        stats::TimingState,
        IRPhase, Verbosity,
    },
    runtime::{Reservation, RuntimeError, SpuFunction, SpuRuntime},
    storage::GuestStorage,
};
use spucache::CacheRecord;
use std::{fmt::Write, sync::Arc};

/// Restores the calling thread's previous [TimingState] when dropped.
struct Timing<'a> {
    rt: &'a SpuRuntime,
    prev: TimingState,
}

impl<'a> Timing<'a> {
    fn enter(rt: &'a SpuRuntime, state: TimingState) -> Self {
        Self {
            rt,
            prev: rt.timing_state(state),
        }
    }
}

impl Drop for Timing<'_> {
    fn drop(&mut self) {
        self.rt.timing_state(self.prev);
    }
}

pub struct SpuRecompiler {
    analyser: Analyser,
    compiler: Arc<dyn Compiler>,
    runtime: Arc<SpuRuntime>,
    initialised: bool,
}

impl SpuRecompiler {
    /// Create a recompiler using `rt`'s compiler.
    pub fn new(rt: Arc<SpuRuntime>) -> Self {
        let compiler = rt.compiler();
        Self::with_compiler(rt, compiler)
    }

    fn with_compiler(rt: Arc<SpuRuntime>, compiler: Arc<dyn Compiler>) -> Self {
        Self {
            analyser: Analyser::new(rt.max_function_words()),
            compiler,
            runtime: rt,
            initialised: false,
        }
    }

    /// Create a recompiler using the baseline backend, whatever `rt` was configured with.
    pub fn make_asm_recompiler(rt: Arc<SpuRuntime>) -> Self {
        Self::with_compiler(rt, compiler_for(CompilerKind::Asm))
    }

    /// Create a recompiler using the optimising backend, whatever `rt` was configured with.
    pub fn make_ir_recompiler(rt: Arc<SpuRuntime>) -> Self {
        Self::with_compiler(rt, compiler_for(CompilerKind::Ir))
    }

    /// Prepare the shared runtime for use: the first call on any thread preloads the persistent
    /// cache. Further calls do nothing.
    pub fn init(&mut self) {
        if !self.initialised {
            self.runtime.preload();
            self.initialised = true;
        }
    }

    pub fn runtime(&self) -> &Arc<SpuRuntime> {
        &self.runtime
    }

    /// The analysis tables of the last function this recompiler discovered.
    pub fn analyser(&self) -> &Analyser {
        &self.analyser
    }

    /// Return the native entry point for `pc`, discovering and compiling the function there if
    /// the dispatch table doesn't already know it.
    pub fn dispatch<S: GuestStorage + ?Sized>(
        &mut self,
        ls: &S,
        pc: u32,
    ) -> Result<SpuFunction, RuntimeError> {
        let pc = pc & LS_MASK;
        let rt = Arc::clone(&self.runtime);
        let _t = Timing::enter(&rt, TimingState::Dispatching);
        let d = rt.dispatcher();
        if d.is_resolved(pc) {
            return Ok(d.get(pc));
        }
        self.resolve(ls, pc)
    }

    /// Discover the function at `pc` and return its compiled entry point, compiling it if no
    /// thread has done so before. The function ends at the entry of any function compiled
    /// earlier. Unlike [Self::dispatch] this always reads the local storage, so
    /// it notices code that has changed since the dispatch slot was set.
    pub fn resolve<S: GuestStorage + ?Sized>(
        &mut self,
        ls: &S,
        pc: u32,
    ) -> Result<SpuFunction, RuntimeError> {
        let func = {
            let rt = &self.runtime;
            let _t = Timing::enter(rt, TimingState::Analysing);
            self.analyser
                .block_with(ls, pc & LS_MASK, &|pos| rt.is_known_entry(pos))?
        };
        if self.runtime.log.enabled(Verbosity::Analysis) {
            self.runtime.log.log(
                Verbosity::Analysis,
                &format!(
                    "function at {:#07x}: {} words, {} blocks",
                    func.entry,
                    func.words.len(),
                    self.analyser.blocks().len()
                ),
            );
        }
        if should_log_ir(IRPhase::Analysis) {
            let mut s = String::new();
            self.dump(&mut s);
            log_ir(&format!("--- Begin analysis ---\n{s}--- End analysis ---\n"));
        }
        self.compile_function(&func, true)
    }

    /// Compile `func`, which must have been produced by this recompiler's last analysis, and
    /// record it in the persistent cache.
    pub fn compile(&mut self, func: &Function) -> Result<SpuFunction, RuntimeError> {
        self.compile_function(func, true)
    }

    fn compile_function(
        &mut self,
        func: &Function,
        persist: bool,
    ) -> Result<SpuFunction, RuntimeError> {
        let rt = Arc::clone(&self.runtime);
        let rsv = rt.lookup_or_reserve(func.entry, &func.words)?;
        let rsv = match rsv {
            Reservation::Compiled(f) => {
                rt.install(func.entry, &func.words)?;
                return Ok(f.entry());
            }
            Reservation::Reserved(rsv) => rsv,
        };
        let r = {
            let _t = Timing::enter(&rt, TimingState::Compiling);
            self.compiler.compile(&rt, func, &self.analyser)
        };
        match r {
            Ok(f) => {
                rt.stats.function_compiled_ok();
                if rt.log.enabled(Verbosity::JITEvent) {
                    rt.log.log(
                        Verbosity::JITEvent,
                        &format!(
                            "compiled function at {:#07x} ({} words) with {}",
                            func.entry,
                            func.words.len(),
                            self.compiler.name()
                        ),
                    );
                }
                Ok(rt.add(rsv, f, persist)?.entry())
            }
            Err(e) => {
                rt.stats.function_compiled_err();
                rt.log.log(
                    Verbosity::Error,
                    &format!("compiling function at {:#07x}: {e}", func.entry),
                );
                // Dropping the reservation marks the function as failed.
                drop(rsv);
                Err(RuntimeError::Compilation(e))
            }
        }
    }

    /// Compile a function from the persistent cache. The analysis tables are rebuilt from an
    /// image holding only the record's words, with holes filled with `LNOP`, so the function is
    /// compiled exactly as if it had been discovered in a running program.
    pub fn precompile(&mut self, record: &CacheRecord) -> Result<SpuFunction, RuntimeError> {
        let entry = record.entry & LS_MASK;
        let mut image = vec![0u32; LS_WORDS];
        let start = (entry >> 2) as usize;
        for (slot, w) in image[start..].iter_mut().zip(&record.words) {
            *slot = if *w == 0 { LNOP } else { *w };
        }
        let func = self.analyser.block(&image, entry)?;
        if func.words[..] != record.words[..] {
            self.runtime.log.log(
                Verbosity::Warning,
                &format!(
                    "cached function at {entry:#07x} analyses to {} words, not {}",
                    func.words.len(),
                    record.words.len()
                ),
            );
        }
        let f = self.compile_function(&func, false)?;
        self.runtime.stats.function_preloaded();
        Ok(f)
    }

    /// Render the analysis tables of the last discovered function.
    pub fn dump(&self, out: &mut String) {
        writeln!(out, "compiler: {}", self.compiler.name()).ok();
        self.analyser.dump(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compile::{CompilationError, FailingCompiler},
        isa::{enc, NOP},
        runtime::RuntimeBuilder,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_functions_are_errors() {
        let rt = RuntimeBuilder::new().build().unwrap();
        let mut jit = SpuRecompiler::new(rt);
        assert!(matches!(
            jit.dispatch(&vec![0u32; 4], 8),
            Err(RuntimeError::Compilation(CompilationError::EmptyFunction(8)))
        ));
    }

    #[test]
    fn failures_are_counted() {
        let c = Arc::new(FailingCompiler {
            count: AtomicUsize::new(0),
        });
        let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
        let mut jit = SpuRecompiler::new(Arc::clone(&rt));
        let ls = vec![NOP, enc::stop(1)];
        assert!(matches!(
            jit.resolve(&ls, 0),
            Err(RuntimeError::Compilation(_))
        ));
        assert!(matches!(
            jit.resolve(&ls, 0),
            Err(RuntimeError::CompileFailed { entry: 0 })
        ));
        assert_eq!(c.count.load(Ordering::SeqCst), 1);
        let st = rt.stats.snapshot().unwrap();
        assert_eq!(st.functions_compiled_err, 1);
        assert!(!rt.dispatcher().is_resolved(0));
    }

    #[test]
    fn dump_names_the_backend() {
        let rt = RuntimeBuilder::new().build().unwrap();
        let mut jit = SpuRecompiler::make_ir_recompiler(rt);
        jit.analyser.block(&vec![NOP, enc::stop(1)], 0).unwrap();
        let mut s = String::new();
        jit.dump(&mut s);
        assert!(s.starts_with("compiler: ir\nfunction 0x00000..0x00008 (2 words)\n"));
    }

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    mod native {
        use super::*;
        use crate::compile::CountingCompiler;
        use std::time::Duration;

        #[test]
        fn nop_loop_is_compiled_once() {
            let c = CountingCompiler::new(CompilerKind::Asm);
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let ls = vec![NOP, enc::br(4, 4)];
            let f1 = jit.dispatch(&ls, 0).unwrap();
            let f2 = jit.dispatch(&ls, 0).unwrap();
            assert_eq!(f1 as usize, f2 as usize);
            assert_eq!(c.count(), 1);
            // Rediscovering the same code hits the runtime's cache.
            jit.resolve(&ls, 0).unwrap();
            assert_eq!(c.count(), 1);
            assert_eq!(rt.stats.snapshot().unwrap().cache_hits, 1);
        }

        #[test]
        fn both_backends() {
            let ls = vec![NOP, enc::ai(3, 3, 1), enc::stop(1)];
            let mks: [fn(Arc<SpuRuntime>) -> SpuRecompiler; 2] = [
                SpuRecompiler::make_asm_recompiler,
                SpuRecompiler::make_ir_recompiler,
            ];
            for mk in mks {
                let rt = RuntimeBuilder::new().build().unwrap();
                let mut jit = mk(Arc::clone(&rt));
                let f = jit.dispatch(&ls, 0).unwrap();
                assert_eq!(rt.dispatcher().get(0) as usize, f as usize);
            }
        }

        #[test]
        fn preload_from_cache() {
            let dir = tempfile::TempDir::new().unwrap();
            let p = dir.path().join("cache");
            let ls = vec![
                enc::brz(0, 0x10, 3),
                enc::ai(3, 3, 1),
                enc::br(8, 0x14),
                crate::isa::LNOP,
                enc::ai(4, 4, 1),
                enc::stop(1),
            ];
            let key = {
                let rt = RuntimeBuilder::new().cache(&p).build().unwrap();
                assert!(rt.has_cache());
                let mut jit = SpuRecompiler::new(Arc::clone(&rt));
                jit.init();
                jit.dispatch(&ls, 0).unwrap();
                let mut a = Analyser::new(rt.max_function_words());
                a.block(&ls, 0).unwrap().words
            };

            let c = CountingCompiler::with_delay(CompilerKind::Ir, Duration::ZERO);
            let rt = RuntimeBuilder::new()
                .cache(&p)
                .compiler(c.clone())
                .jobs(2)
                .build()
                .unwrap();
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            jit.init();
            jit.init();
            assert_eq!(c.count(), 1);
            assert_eq!(rt.stats.snapshot().unwrap().functions_preloaded, 1);
            // Preloading binds the cached function's address...
            assert!(rt.dispatcher().is_resolved(0));
            // ...and content addressing finds it anywhere else.
            let mut moved = vec![0u32; 0x20];
            moved[0x10..0x16].copy_from_slice(&ls);
            jit.dispatch(&moved, 0x40).unwrap();
            assert_eq!(c.count(), 1);
            assert_eq!(key.len(), 6);
        }

        #[test]
        fn unusable_cache_still_compiles() {
            let dir = tempfile::TempDir::new().unwrap();
            // A directory can't be opened as a cache file.
            let rt = RuntimeBuilder::new().cache(dir.path()).build().unwrap();
            assert!(!rt.has_cache());
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            jit.init();
            let ls = vec![NOP, enc::stop(1)];
            jit.dispatch(&ls, 0).unwrap();
            assert!(rt.dispatcher().is_resolved(0));
        }
    }
}
