//! The implementation of the `SPURTD_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should spurt's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log JIT events (e.g. a function being compiled, a cache being preloaded).
    JITEvent,
    /// Log every analysed function.
    Analysis,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` should default to the platform specific standard
    /// for logging (e.g. stderr).
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("SPURTD_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Empty any existing log file, so that this run's log isn't appended to a
                    // previous run's.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("SPURTD_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid SPURTD_LOG level '{s}': {e}"))?;
        let max_level = Verbosity::COUNT - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("SPURTD_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Should messages at `level` be logged? Useful to avoid building expensive messages.
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "spurt-error",
                Verbosity::Warning => "spurt-warning",
                Verbosity::JITEvent => "spurt-jit-event",
                Verbosity::Analysis => "spurt-analysis",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

/// The intermediate forms that `SPURTD_LOG_IR` can print.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The analysis tables of each discovered function.
    Analysis,
    /// The IR of the optimising backend.
    Ir,
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let x = env::var("SPURTD_LOG_IR").ok()?;
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => {
                eprintln!("spurt-error: SPURTD_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'");
                return None;
            }
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            match IRPhase::from_str(x) {
                Ok(p) => {
                    log_phases.insert(p);
                }
                Err(e) => eprintln!("spurt-error: {e}"),
            }
        }
        if path != "-" {
            // Empty any existing log file, so that this run's log isn't appended to a previous
            // run's.
            File::create(path).ok();
        }
        Some((path.to_string(), log_phases))
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "analysis" => Ok(Self::Analysis),
                "ir" => Ok(Self::Ir),
                _ => Err(format!("Invalid SPURTD_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
