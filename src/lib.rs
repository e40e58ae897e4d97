//! tracejit - adaptive trace compilation core.
//!
//! The crate decides when an interpreted code path is hot, turns recorded
//! traces into compiled procedures through an external optimizer and
//! backend, and governs what happens when a guard fails at run time.
//!
//! # Primary Usage
//!
//! ```ignore
//! use tracejit::core::{JitConfig, Kind};
//! use tracejit::metainterp::{EntryOutcome, JitDriver, LoopCompiler, SimpleOptimizer, WarmEnterState};
//!
//! let compiler = LoopCompiler::new(Box::new(backend), Box::new(SimpleOptimizer));
//! let driver = JitDriver::new("interp", 1, vec![Kind::Int, Kind::Ref], Kind::Int);
//! let mut jit = WarmEnterState::new(JitConfig::default(), driver, compiler);
//!
//! // Called by the interpreter at every loop header.
//! match jit.maybe_compile_and_run(&mut tracer, &greenkey, &redargs)? {
//!     EntryOutcome::Interpret => { /* keep interpreting */ }
//!     EntryOutcome::Exit(exit) => { /* frame finished in compiled code */ }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (values, config, errors, session, analysis)
//! - [`codewriter`] - Flow graph to jitcode pipeline and the bytecode assembler
//! - [`metainterp`] - Cell table, loop/bridge compiler and guard failure handling

pub mod core;
pub mod codewriter;
pub mod metainterp;

pub use core::{
    // Values
    Const, GcRef, Kind, Value,
    // Configuration and errors
    CompileError, CompileResult, ConfigError, InvalidLoop, JitConfig, JitError, OptimizerLevel,
    // Session management
    CompilationSession, SessionStats,
};
pub use codewriter::{Assembler, CodeWriter, JitCode};
pub use metainterp::{
    Backend, EntryOutcome, JitDriver, JitExit, LoopCompiler, Optimizer, Tracer, WarmEnterState,
};
