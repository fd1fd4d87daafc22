//! The runtime: the process-wide store of compiled functions, the dispatch table that guest
//! threads jump through, and the patchable thunks that bind compiled code together.
//!
//! Functions are keyed by content ([FunctionKey]), not by address: the same code at two addresses
//! is compiled once. Each address additionally records which keys have been found there; when an
//! address has several (e.g. because code was overwritten), its dispatch slot points to a switch
//! thunk that picks between them by looking at the local storage.
//!
//! At most one thread compiles a given key. Other threads asking for that key while it is being
//! compiled block until the compiling thread calls [SpuRuntime::add] or gives up.

use crate::{
    analysis::{FunctionKey, DEFAULT_MAX_FUNCTION_WORDS},
    codebuf::ExecArena,
    isa::LS_MASK,
    compile::{self, at, CompilationError, CompiledFunction, Compiler, CompilerKind},
    log::{
        stats::{Stats, TimingState},
        Log, Verbosity,
    },
    recompiler::SpuRecompiler,
    thread::SpuThread,
};
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use spucache::{CacheRecord, SpuCache};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    env,
    error::Error,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread::{self, ThreadId},
};
use thiserror::Error;

mod dispatch;
mod trampoline;

pub use dispatch::DispatchTable;
pub use trampoline::{spu_branch, spu_dispatch, spu_select, ThunkHead};
use trampoline::{emit_thunk, Patchpoint, Switch, Workload};

/// The native code signature of everything a guest thread can jump to: compiled functions,
/// thunks, and the resolvers. `rip` is the thunk data block when called through a thunk, and
/// meaningless otherwise.
pub type SpuFunction = unsafe extern "C" fn(spu: *mut SpuThread, ls: *mut u8, rip: *const u8);

/// Why a guest thread could not continue.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Compiling the function at {entry:#07x} failed previously")]
    CompileFailed { entry: u32 },
    #[error("The function at {entry:#07x} was requested while this thread was compiling it")]
    RecursiveCompile { entry: u32 },
    #[error(transparent)]
    Compilation(#[from] CompilationError),
}

#[derive(Debug)]
enum FunctionState {
    /// The given thread has reserved this key and is compiling it.
    Compiling(ThreadId),
    Compiled(Arc<dyn CompiledFunction>),
    /// Compilation failed: it will not be retried.
    Failed,
}

#[derive(Default)]
struct Functions {
    map: BTreeMap<FunctionKey, FunctionState>,
    /// The keys that have been found at each entry address.
    by_addr: HashMap<u32, BTreeSet<FunctionKey>>,
}

/// The result of [SpuRuntime::lookup_or_reserve].
pub enum Reservation<'a> {
    /// The key has already been compiled.
    Compiled(Arc<dyn CompiledFunction>),
    /// The calling thread must compile the key and pass the result to [SpuRuntime::add].
    Reserved(ReservationGuard<'a>),
}

/// The right, and obligation, to compile a key. If dropped without being passed to
/// [SpuRuntime::add], the key is marked as failed and any waiting threads are woken.
pub struct ReservationGuard<'a> {
    rt: &'a SpuRuntime,
    entry: u32,
    key: FunctionKey,
    completed: bool,
}

impl ReservationGuard<'_> {
    pub fn key(&self) -> &FunctionKey {
        &self.key
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.rt.fail(&self.key);
        }
    }
}

/// Configure a [SpuRuntime].
pub struct RuntimeBuilder {
    compiler: Option<Arc<dyn Compiler>>,
    compiler_kind: CompilerKind,
    cache_path: Option<PathBuf>,
    max_function_words: usize,
    jobs: usize,
}

impl RuntimeBuilder {
    /// Create a builder with default parameters, ignoring the environment.
    pub fn new() -> Self {
        Self {
            compiler: None,
            compiler_kind: CompilerKind::default(),
            cache_path: None,
            max_function_words: DEFAULT_MAX_FUNCTION_WORDS,
            jobs: default_jobs(),
        }
    }

    /// Create a builder configured from the `SPURT_*` environment variables.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut b = Self::new();
        if let Ok(x) = env::var("SPURT_JITC") {
            b.compiler_kind = CompilerKind::from_str(&x)?;
        }
        if let Ok(x) = env::var("SPURT_CACHE") {
            b.cache_path = Some(PathBuf::from(x));
        }
        if let Ok(x) = env::var("SPURT_MAX_FUNC_SIZE") {
            b.max_function_words = x
                .parse()
                .map_err(|e| format!("Invalid SPURT_MAX_FUNC_SIZE '{x}': {e}"))?;
        }
        if let Ok(x) = env::var("SPURT_JOBS") {
            b.jobs = x
                .parse()
                .map_err(|e| format!("Invalid SPURT_JOBS '{x}': {e}"))?;
        }
        Ok(b)
    }

    /// Select one of the built-in compilers.
    pub fn compiler_kind(mut self, kind: CompilerKind) -> Self {
        self.compiler_kind = kind;
        self.compiler = None;
        self
    }

    /// Use a custom compiler.
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Persist discovered functions to, and preload them from, the file at `path`.
    pub fn cache<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// The maximum length of a function, in words.
    pub fn max_function_words(mut self, n: usize) -> Self {
        self.max_function_words = n;
        self
    }

    /// How many threads [SpuRuntime::preload] uses.
    pub fn jobs(mut self, n: usize) -> Self {
        self.jobs = n;
        self
    }

    pub fn build(self) -> Result<Arc<SpuRuntime>, Box<dyn Error>> {
        let log = Log::new()?;
        let cache = self.cache_path.map(|p| {
            SpuCache::initialize();
            let c = SpuCache::new(&p);
            for d in c.diagnostics() {
                log.log(
                    Verbosity::Warning,
                    &format!("Function cache {}: {d}", p.display()),
                );
            }
            Mutex::new(c)
        });
        let compiler = self
            .compiler
            .unwrap_or_else(|| compile::compiler_for(self.compiler_kind));
        Ok(Arc::new(SpuRuntime {
            functions: RwLock::new(Functions::default()),
            wait_lock: Mutex::new(()),
            cond: Condvar::new(),
            dispatcher: DispatchTable::new(),
            arena: ExecArena::new(),
            patchpoints: Mutex::new(HashMap::new()),
            switches: Mutex::new(Vec::new()),
            cache,
            compiler,
            max_function_words: self.max_function_words,
            jobs: self.jobs.max(1),
            preloaded: Once::new(),
            log,
            stats: Stats::new(),
        }))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_jobs() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

pub struct SpuRuntime {
    functions: RwLock<Functions>,
    /// Held while checking for, and waiting on, a key being compiled by another thread.
    wait_lock: Mutex<()>,
    /// Notified whenever a key stops being compiled (successfully or not).
    cond: Condvar,
    dispatcher: DispatchTable,
    /// Where all thunks live.
    arena: ExecArena,
    /// Branch patchpoints, by target address.
    patchpoints: Mutex<HashMap<u32, Vec<Box<Patchpoint>>>>,
    /// Every switch ever created. A replaced switch may still be running on another thread, so
    /// none are freed before the runtime.
    switches: Mutex<Vec<Box<Switch>>>,
    cache: Option<Mutex<SpuCache>>,
    compiler: Arc<dyn Compiler>,
    max_function_words: usize,
    jobs: usize,
    preloaded: Once,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
}

impl SpuRuntime {
    pub fn dispatcher(&self) -> &DispatchTable {
        &self.dispatcher
    }

    pub fn compiler(&self) -> Arc<dyn Compiler> {
        Arc::clone(&self.compiler)
    }

    pub fn max_function_words(&self) -> usize {
        self.max_function_words
    }

    /// Has a function been compiled for the entry address `addr`? Inner entries of functions
    /// compiled elsewhere don't count.
    pub fn is_known_entry(&self, addr: u32) -> bool {
        self.dispatcher.is_resolved(addr)
            && self
                .functions
                .read()
                .by_addr
                .contains_key(&(addr & LS_MASK))
    }

    /// Is a persistent cache in use?
    pub fn has_cache(&self) -> bool {
        self.cache.as_ref().is_some_and(|c| c.lock().is_open())
    }

    /// Return the compiled function for `key`, or reserve `key` for compilation by the calling
    /// thread. If another thread is compiling `key`, block until it has finished. `entry` is
    /// only used for error reporting.
    pub fn lookup_or_reserve(
        &self,
        entry: u32,
        key: &FunctionKey,
    ) -> Result<Reservation<'_>, RuntimeError> {
        match self.functions.read().map.get(key) {
            Some(FunctionState::Compiled(f)) => {
                self.stats.cache_hit();
                return Ok(Reservation::Compiled(Arc::clone(f)));
            }
            Some(FunctionState::Failed) => return Err(RuntimeError::CompileFailed { entry }),
            Some(FunctionState::Compiling(_)) | None => (),
        }

        let me = thread::current().id();
        let mut waited = false;
        loop {
            // Hold `wait_lock` from checking the map until we're waiting, so that the completing
            // thread can't notify in between.
            let mut lk = self.wait_lock.lock();
            {
                let mut fs = self.functions.write();
                match fs.map.get(key) {
                    None => {
                        fs.map
                            .insert(Arc::clone(key), FunctionState::Compiling(me));
                        return Ok(Reservation::Reserved(ReservationGuard {
                            rt: self,
                            entry,
                            key: Arc::clone(key),
                            completed: false,
                        }));
                    }
                    Some(FunctionState::Compiled(f)) => {
                        self.stats.cache_hit();
                        return Ok(Reservation::Compiled(Arc::clone(f)));
                    }
                    Some(FunctionState::Failed) => {
                        return Err(RuntimeError::CompileFailed { entry })
                    }
                    Some(FunctionState::Compiling(tid)) if *tid == me => {
                        return Err(RuntimeError::RecursiveCompile { entry })
                    }
                    Some(FunctionState::Compiling(_)) => (),
                }
            }
            if !waited {
                self.stats.compile_wait();
                waited = true;
            }
            self.cond.wait(&mut lk);
        }
    }

    /// Wake every thread waiting in [Self::lookup_or_reserve].
    fn notify(&self) {
        let _lk = self.wait_lock.lock();
        self.cond.notify_all();
    }

    fn fail(&self, key: &FunctionKey) {
        self.functions
            .write()
            .map
            .insert(Arc::clone(key), FunctionState::Failed);
        self.notify();
    }

    /// Complete the reservation `rsv` with the compiled function `f`: store `f`, wake any waiting
    /// threads, and bind the reservation's entry address (and every patchpoint targeting it) to
    /// `f`. If `persist` is true, the function is also appended to the persistent cache.
    pub fn add(
        &self,
        mut rsv: ReservationGuard<'_>,
        f: Arc<dyn CompiledFunction>,
        persist: bool,
    ) -> Result<Arc<dyn CompiledFunction>, RuntimeError> {
        rsv.completed = true;
        let entry = rsv.entry;
        let key = Arc::clone(&rsv.key);
        let (r, inner) = {
            let mut fs = self.functions.write();
            fs.map
                .insert(Arc::clone(&key), FunctionState::Compiled(Arc::clone(&f)));
            fs.by_addr.entry(entry).or_default().insert(Arc::clone(&key));
            let r = self.rebuild_slot(&fs, entry);
            (r, self.bind_inner_entries(&fs, entry, &*f))
        };
        self.notify();
        r?;
        self.repatch(entry);
        for pos in inner {
            self.repatch(pos);
        }

        if persist {
            if let Some(c) = &self.cache {
                if let Err(e) = c.lock().add(entry, &key) {
                    self.log.log(
                        Verbosity::Warning,
                        &format!("Failed to persist function at {entry:#07x}: {e}"),
                    );
                }
            }
        }
        Ok(f)
    }

    /// Record that the already compiled `key` has also been found at `entry`.
    pub fn install(&self, entry: u32, key: &FunctionKey) -> Result<(), RuntimeError> {
        let inner = {
            let mut fs = self.functions.write();
            if !fs.by_addr.entry(entry).or_default().insert(Arc::clone(key)) {
                return Ok(());
            }
            self.rebuild_slot(&fs, entry)?;
            match fs.map.get(key) {
                Some(FunctionState::Compiled(f)) => self.bind_inner_entries(&fs, entry, &**f),
                _ => Vec::new(),
            }
        };
        self.repatch(entry);
        for pos in inner {
            self.repatch(pos);
        }
        Ok(())
    }

    /// Point the dispatch slots of `f`'s inner entries, with `f` running at `entry`, into `f`.
    /// Slots that already lead somewhere, and addresses with functions of their own, are left
    /// alone. Returns the addresses bound.
    fn bind_inner_entries(
        &self,
        fs: &Functions,
        entry: u32,
        f: &dyn CompiledFunction,
    ) -> Vec<u32> {
        f.inner_entries()
            .iter()
            .filter_map(|&(off, code)| {
                let pos = at(entry, off);
                if fs.by_addr.contains_key(&pos) || self.dispatcher.is_resolved(pos) {
                    return None;
                }
                self.dispatcher.set(pos, code);
                Some(pos)
            })
            .collect()
    }

    /// Point the dispatch slot for `entry` at the function(s) compiled for it.
    fn rebuild_slot(
        &self,
        fs: &RwLockWriteGuard<'_, Functions>,
        entry: u32,
    ) -> Result<(), CompilationError> {
        let cands = fs
            .by_addr
            .get(&entry)
            .into_iter()
            .flatten()
            .filter_map(|k| match fs.map.get(k) {
                Some(FunctionState::Compiled(f)) => Some((Arc::clone(k), f.entry())),
                _ => None,
            })
            .collect::<Vec<_>>();
        match cands.len() {
            0 => (),
            1 => self.dispatcher.set(entry, cands[0].1),
            n => {
                let sw = Box::new(Switch {
                    head: ThunkHead::new(spu_select),
                    entry,
                    tree: Workload::build(&cands),
                });
                let code = emit_thunk(&self.arena, &sw.head)?;
                self.switches.lock().push(sw);
                self.stats.trampoline_created();
                self.dispatcher.set(entry, code);
                if self.log.enabled(Verbosity::JITEvent) {
                    self.log.log(
                        Verbosity::JITEvent,
                        &format!("{n} functions at {entry:#07x}: dispatching through a switch"),
                    );
                }
            }
        }
        Ok(())
    }

    /// Bind every patchpoint targeting `entry` to its dispatch slot.
    fn repatch(&self, entry: u32) {
        let pps = self.patchpoints.lock();
        if let Some(v) = pps.get(&entry) {
            let f = self.dispatcher.get(entry);
            for pp in v {
                pp.head.retarget(f);
            }
        }
    }

    /// Emit a thunk for the data block starting with `head`, which must live as long as the
    /// runtime.
    pub(crate) fn make_thunk(&self, head: &ThunkHead) -> Result<SpuFunction, CompilationError> {
        emit_thunk(&self.arena, head)
    }

    /// Create a thunk branching to `target`. Until `target` is compiled the thunk resolves it
    /// on each use; afterwards it jumps straight to the compiled code.
    pub fn make_branch_patchpoint(&self, target: u32) -> Result<SpuFunction, CompilationError> {
        let pp = Box::new(Patchpoint {
            head: ThunkHead::new(spu_branch),
            target,
        });
        let code = emit_thunk(&self.arena, &pp.head)?;
        // Holding the lock while checking the slot means that a concurrent `add` either sees
        // this patchpoint or has already resolved the slot.
        let mut pps = self.patchpoints.lock();
        if self.dispatcher.is_resolved(target) {
            pp.head.retarget(self.dispatcher.get(target));
        }
        pps.entry(target).or_default().push(pp);
        self.stats.patchpoint_created();
        Ok(code)
    }

    /// Compile every function in the persistent cache, using up to `jobs` threads. This happens
    /// at most once per runtime; later calls return immediately.
    pub fn preload(self: &Arc<Self>) {
        self.preloaded.call_once(|| self.preload_inner());
    }

    fn preload_inner(self: &Arc<Self>) {
        let records = match &self.cache {
            Some(c) => c.lock().get().collect::<Vec<CacheRecord>>(),
            None => return,
        };
        if records.is_empty() {
            return;
        }
        self.log.log(
            Verbosity::JITEvent,
            &format!("Preloading {} functions", records.len()),
        );
        let next = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..self.jobs.min(records.len()) {
                s.spawn(|| {
                    let mut jit = SpuRecompiler::new(Arc::clone(self));
                    while let Some(r) = records.get(next.fetch_add(1, Ordering::Relaxed)) {
                        if let Err(e) = jit.precompile(r) {
                            self.log.log(
                                Verbosity::Warning,
                                &format!("Preloading function at {:#07x}: {e}", r.entry),
                            );
                        }
                    }
                });
            }
        });
    }

    /// Set the calling thread's [TimingState], returning the previous one.
    pub(crate) fn timing_state(&self, state: TimingState) -> TimingState {
        self.stats.timing_state(state)
    }
}

impl Drop for SpuRuntime {
    fn drop(&mut self) {
        self.stats.output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compile::FailingCompiler,
        isa::{enc, NOP},
    };
    use std::{
        sync::{atomic::AtomicUsize, Barrier},
        time::Duration,
    };

    fn key(ws: &[u32]) -> FunctionKey {
        Arc::from(ws.to_vec())
    }

    #[test]
    fn failed_keys_are_never_retried() {
        let rt = RuntimeBuilder::new().build().unwrap();
        let k = key(&[NOP, enc::stop(1)]);
        match rt.lookup_or_reserve(0, &k).unwrap() {
            Reservation::Reserved(g) => drop(g),
            Reservation::Compiled(_) => panic!(),
        }
        assert!(matches!(
            rt.lookup_or_reserve(0x40, &k),
            Err(RuntimeError::CompileFailed { entry: 0x40 })
        ));
    }

    #[test]
    fn recursive_requests_are_diagnosed() {
        let rt = RuntimeBuilder::new().build().unwrap();
        let k = key(&[NOP, enc::stop(1)]);
        let _g = match rt.lookup_or_reserve(0, &k).unwrap() {
            Reservation::Reserved(g) => g,
            Reservation::Compiled(_) => panic!(),
        };
        assert!(matches!(
            rt.lookup_or_reserve(0, &k),
            Err(RuntimeError::RecursiveCompile { entry: 0 })
        ));
    }

    #[test]
    fn waiters_see_failure() {
        let rt = RuntimeBuilder::new().build().unwrap();
        let k = key(&[NOP, enc::stop(1)]);
        let b = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                let g = match rt.lookup_or_reserve(0, &k).unwrap() {
                    Reservation::Reserved(g) => g,
                    Reservation::Compiled(_) => panic!(),
                };
                b.wait();
                thread::sleep(Duration::from_millis(50));
                drop(g);
            });
            b.wait();
            assert!(matches!(
                rt.lookup_or_reserve(0, &k),
                Err(RuntimeError::CompileFailed { .. })
            ));
        });
        assert_eq!(rt.stats.snapshot().unwrap().compile_waits, 1);
    }

    #[test]
    fn failing_backend_compiles_once() {
        let c = Arc::new(FailingCompiler {
            count: AtomicUsize::new(0),
        });
        let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
        let ls = vec![NOP, enc::stop(1)];
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut jit = SpuRecompiler::new(Arc::clone(&rt));
                    assert!(jit.resolve(&ls, 0).is_err());
                });
            }
        });
        assert_eq!(c.count.load(Ordering::SeqCst), 1);
    }

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    mod native {
        use super::*;
        use crate::{analysis::Analyser, compile::CountingCompiler, isa::reg};

        #[test]
        fn at_most_one_compile() {
            let c = CountingCompiler::with_delay(CompilerKind::Asm, Duration::from_millis(50));
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let ls = vec![NOP, enc::ai(3, 3, 1), enc::stop(1)];
            let entries = thread::scope(|s| {
                let hs = (0..8)
                    .map(|_| {
                        s.spawn(|| {
                            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
                            jit.resolve(&ls, 0).unwrap() as usize
                        })
                    })
                    .collect::<Vec<_>>();
                hs.into_iter()
                    .map(|h| h.join().unwrap())
                    .collect::<Vec<_>>()
            });
            assert_eq!(c.count(), 1);
            assert!(entries.iter().all(|e| *e == entries[0]));
            assert_eq!(rt.dispatcher().get(0) as usize, entries[0]);
            let st = rt.stats.snapshot().unwrap();
            assert_eq!(st.functions_compiled_ok, 1);
            assert_eq!(st.cache_hits + 1, 8);
        }

        #[test]
        fn same_code_at_two_addresses() {
            let c = CountingCompiler::new(CompilerKind::Asm);
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let body = [NOP, enc::ai(3, 3, 1), enc::ai(4, 4, 2), enc::stop(1)];
            let mut ls = vec![0; 0x100];
            ls[0x10..0x14].copy_from_slice(&body);
            ls[0x80..0x84].copy_from_slice(&body);
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let a = jit.dispatch(&ls, 0x40).unwrap();
            let b = jit.dispatch(&ls, 0x200).unwrap();
            assert_eq!(c.count(), 1);
            assert_eq!(a as usize, b as usize);
            assert_eq!(rt.dispatcher().get(0x200) as usize, a as usize);
        }

        #[test]
        fn overwritten_code_gets_a_switch() {
            let c = CountingCompiler::new(CompilerKind::Asm);
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let ls1 = vec![NOP, enc::ai(3, 3, 1), enc::stop(1)];
            let ls2 = vec![NOP, enc::ai(3, 3, 2), enc::stop(1)];
            let f1 = jit.resolve(&ls1, 0).unwrap();
            assert_eq!(rt.dispatcher().get(0) as usize, f1 as usize);
            let f2 = jit.resolve(&ls2, 0).unwrap();
            assert_eq!(c.count(), 2);
            let slot = rt.dispatcher().get(0) as usize;
            assert_ne!(slot, f1 as usize);
            assert_ne!(slot, f2 as usize);
            assert_eq!(rt.stats.snapshot().unwrap().trampolines, 1);
            let fs = rt.functions.read();
            let cands = fs
                .by_addr
                .get(&0)
                .unwrap()
                .iter()
                .map(|k| match fs.map.get(k) {
                    Some(FunctionState::Compiled(f)) => (Arc::clone(k), f.entry()),
                    _ => panic!(),
                })
                .collect::<Vec<_>>();
            let tree = Workload::build(&cands);
            assert_eq!(tree.select(&ls1, 0) as usize, f1 as usize);
            assert_eq!(tree.select(&ls2, 0) as usize, f2 as usize);
        }

        #[test]
        fn patchpoints_are_bound_when_their_target_is_compiled() {
            let rt = RuntimeBuilder::new().build().unwrap();
            rt.make_branch_patchpoint(0x40).unwrap();
            {
                let pps = rt.patchpoints.lock();
                assert_eq!(pps[&0x40][0].head.jump(), spu_branch as usize);
            }
            let mut ls = vec![0; 0x20];
            ls[0x10] = NOP;
            ls[0x11] = enc::stop(1);
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let f = jit.resolve(&ls, 0x40).unwrap();
            {
                let pps = rt.patchpoints.lock();
                assert_eq!(pps[&0x40][0].head.jump(), f as usize);
            }
            // Patchpoints created afterwards are bound immediately.
            rt.make_branch_patchpoint(0x40).unwrap();
            let pps = rt.patchpoints.lock();
            assert_eq!(pps[&0x40][1].head.jump(), f as usize);
        }

        #[test]
        fn patchpoints_race_with_compilation() {
            let mut ls1 = vec![0u32; 0x13];
            ls1[0x10..].copy_from_slice(&[NOP, enc::ai(3, 3, 1), enc::stop(1)]);
            let mut ls2 = vec![0u32; 0x13];
            ls2[0x10..].copy_from_slice(&[NOP, enc::ai(3, 3, 2), enc::stop(2)]);
            for _ in 0..16 {
                let rt = RuntimeBuilder::new().build().unwrap();
                let b = Barrier::new(6);
                thread::scope(|s| {
                    for _ in 0..4 {
                        s.spawn(|| {
                            b.wait();
                            for _ in 0..16 {
                                rt.make_branch_patchpoint(0x40).unwrap();
                            }
                        });
                    }
                    for ls in [&ls1, &ls2] {
                        let (rt, b) = (&rt, &b);
                        s.spawn(move || {
                            let mut jit = SpuRecompiler::new(Arc::clone(rt));
                            b.wait();
                            jit.resolve(ls, 0x40).unwrap();
                        });
                    }
                });
                // Two functions at one address: the slot is a switch...
                let slot = rt.dispatcher().get(0x40) as usize;
                assert_eq!(rt.stats.snapshot().unwrap().trampolines, 1);
                // ...and every patchpoint leads to it, whenever it was created.
                let pps = rt.patchpoints.lock();
                assert_eq!(pps[&0x40].len(), 64);
                assert!(pps[&0x40].iter().all(|pp| pp.head.jump() == slot));
            }
        }

        #[test]
        fn return_points_enter_the_caller() {
            // 0x100: brsl $lr, 0x200
            // 0x104: brsl $lr, 0x200
            // 0x108: stop 1
            let code = [
                enc::brsl(0x100, 0x200, reg::LR),
                enc::brsl(0x104, 0x200, reg::LR),
                enc::stop(1),
            ];
            let mut ls = vec![0u32; 0x43];
            ls[0x40..].copy_from_slice(&code);
            let c = CountingCompiler::new(CompilerKind::Asm);
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let f = jit.dispatch(&ls, 0x100).unwrap();
            let d = rt.dispatcher();
            assert!(d.is_resolved(0x104) && d.is_resolved(0x108));
            assert_ne!(d.get(0x104) as usize, f as usize);
            jit.dispatch(&ls, 0x108).unwrap();
            assert_eq!(c.count(), 1);
            // Only the function's own entry starts a function.
            assert!(rt.is_known_entry(0x100));
            assert!(!rt.is_known_entry(0x104));

            // The same code elsewhere exposes its return points there too.
            let mut moved = vec![0u32; 0x83];
            moved[0x80..].copy_from_slice(&code);
            jit.dispatch(&moved, 0x200).unwrap();
            assert_eq!(c.count(), 1);
            assert!(d.is_resolved(0x204) && d.is_resolved(0x208));

            // An address that already has a function of its own keeps it.
            let c = CountingCompiler::new(CompilerKind::Asm);
            let rt = RuntimeBuilder::new().compiler(c.clone()).build().unwrap();
            let mut jit = SpuRecompiler::new(Arc::clone(&rt));
            let tail = jit.dispatch(&ls, 0x104).unwrap();
            jit.dispatch(&ls, 0x100).unwrap();
            assert_eq!(c.count(), 2);
            assert_eq!(rt.dispatcher().get(0x104) as usize, tail as usize);
            // The caller stops where the earlier function starts.
            assert_eq!(jit.analyser().limit(), 0x104);
        }

        #[test]
        fn analysis_is_shared_with_backends() {
            // Sanity check that a backend sees the tables of the function it is compiling.
            let rt = RuntimeBuilder::new().build().unwrap();
            let mut a = Analyser::new(rt.max_function_words());
            let ls = vec![NOP, enc::br(4, 0)];
            let f = a.block(&ls, 0).unwrap();
            let cf = rt.compiler().compile(&rt, &f, &a).unwrap();
            assert_eq!(cf.key(), &f.words);
        }
    }
}
