//! A recompiler for SPU guest code: discovers functions in a local storage, compiles them, and
//! dispatches guest control flow into the results.

#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod analysis;
pub(crate) mod codebuf;
pub mod compile;
pub mod isa;
mod log;
pub mod recompiler;
pub mod runtime;
pub mod storage;
pub mod thread;

pub use self::analysis::{Analyser, Function, FunctionKey};
pub use self::compile::{CompilationError, CompiledFunction, Compiler, CompilerKind};
pub use self::recompiler::SpuRecompiler;
pub use self::runtime::{RuntimeBuilder, RuntimeError, SpuFunction, SpuRuntime};
pub use self::storage::{GuestStorage, LocalStorage};
pub use self::thread::{IgnoreHandler, InsnHandler, SpuThread, ThreadState};
