//! This module records statistics about the recompiler. The accuracy of the statistics varies:
//! for example, "durations" are wall-clock time, which inevitably fail to account for context
//! switches and the like. Thus the statistics are very much in "best effort" territory.

#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    ops::DerefMut,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. In non-testing mode, this is only enabled if the end user
/// defines the environment variable `SPURTD_LOG_STATS`. In testing mode, this is always enabled,
/// with output being sent to `stderr`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the outer `Option` makes "are we recording?" a
    // simple null check: only if stats are to be recorded do we pay for locking a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many functions were compiled successfully?
    pub(crate) functions_compiled_ok: u64,
    /// How many functions failed to compile?
    pub(crate) functions_compiled_err: u64,
    /// How many functions were compiled from the persistent cache before execution?
    pub(crate) functions_preloaded: u64,
    /// How many lookups found an already compiled function?
    pub(crate) cache_hits: u64,
    /// How many lookups had to wait for another thread to finish compiling?
    pub(crate) compile_waits: u64,
    /// How many branch patchpoints have been created?
    pub(crate) patchpoints: u64,
    /// How many switch trampolines have been created?
    pub(crate) trampolines: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            inner: env::var("SPURTD_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `SPURTD_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            // A panic while the lock was held can't leave the counters meaningfully corrupt.
            let mut lk = mtx.lock().unwrap_or_else(|e| e.into_inner());
            f(lk.deref_mut());
        }
    }

    /// Return a copy of the current statistics, if they are being recorded.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Option<StatsInner> {
        self.inner
            .as_ref()
            .map(|mtx| mtx.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn function_compiled_ok(&self) {
        self.update_with(|inner| inner.functions_compiled_ok += 1);
    }

    pub fn function_compiled_err(&self) {
        self.update_with(|inner| inner.functions_compiled_err += 1);
    }

    pub fn function_preloaded(&self) {
        self.update_with(|inner| inner.functions_preloaded += 1);
    }

    pub fn cache_hit(&self) {
        self.update_with(|inner| inner.cache_hits += 1);
    }

    pub fn compile_wait(&self) {
        self.update_with(|inner| inner.compile_waits += 1);
    }

    pub fn patchpoint_created(&self) {
        self.update_with(|inner| inner.patchpoints += 1);
    }

    pub fn trampoline_created(&self) {
        self.update_with(|inner| inner.trampolines += 1);
    }

    /// Change the [TimingState] the current thread is in, returning the previous state.
    pub fn timing_state(&self, new_state: TimingState) -> TimingState {
        let mut prev = TimingState::None;
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = VM_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
            prev = prev_state;
        });
        prev
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            ..Default::default()
        }
    }

    /// Output these statistics to the appropriate output path.
    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = [
            ("functions_compiled_ok", self.functions_compiled_ok),
            ("functions_compiled_err", self.functions_compiled_err),
            ("functions_preloaded", self.functions_preloaded),
            ("cache_hits", self.cache_hits),
            ("compile_waits", self.compile_waits),
            ("patchpoints", self.patchpoints),
            ("trampolines", self.trampolines),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_string()))
        .collect::<Vec<_>>();
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The different timing states a thread can go through.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
// New states must keep the following properties:
//   1. `TimingState` is `repr(T)` where `T` converts `as usize` without loss of information.
//   2. The variants range from `0..TimingState::COUNT`: don't assign numbers to variants.
//   3. A state's `strum` `to_string` is the name of its key in the JSON stats. States whose
//      `to_string` is the empty string don't appear in the JSON stats.
pub(crate) enum TimingState {
    /// The "we don't know what this thread is doing" state. Time spent in this state is not
    /// counted towards anything and is not displayed to the user.
    #[strum(to_string = "")]
    None,
    /// This thread is discovering a function.
    #[strum(to_string = "duration_analysing")]
    Analysing,
    /// This thread is compiling a function.
    #[strum(to_string = "duration_compiling")]
    Compiling,
    /// This thread is looking up (or waiting for) a function in the runtime.
    #[strum(to_string = "duration_dispatching")]
    Dispatching,
}

thread_local! {
    static VM_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}
