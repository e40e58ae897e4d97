// This module hosts the runtime half of the JIT: everything that happens after the
// codewriter produced jitcodes. The warm entry state counts calls per green key and starts
// tracing; the loop compiler turns recorded histories into loops, bridges and entry
// bridges through the optimizer and backend traits; the guard failure manager decides
// between bridge compilation and blackhole replay; the memory manager ages compiled
// procedures out through the token registry; and the execution context carries forced
// virtuals between a residual call and the GUARD_NOT_FORCED that consumes them.

//! Metainterpreter: cells, loop compilation and guard failures.
//!
//! # Key Components
//!
//! ## Warm entry (`warmstate`)
//! - `CellTable`, `JitDriver`, `WarmEnterState::maybe_compile_and_run`
//!
//! ## Compilation (`compile`, `history`)
//! - `LoopCompiler` for loops, retraces, bridges and temporary callbacks
//! - `TokenRegistry` of procedure tokens and target labels
//!
//! ## Guards (`guard`, `context`)
//! - Failure descriptors, per-guard counters, forced-state hand-off
//!
//! ## Collaborators (`backend`, `optimizer`)
//! - Traits implemented by the host; `SimpleOptimizer` keeps traces as recorded

pub mod backend;
pub mod compile;
pub mod context;
pub mod guard;
pub mod history;
pub mod memmgr;
pub mod optimizer;
pub mod warmstate;

pub use backend::Backend;
pub use compile::{BridgeOutcome, CompileStats, LoopCompiler};
pub use context::{CriticalSection, ExecutionContext, ForceToken};
pub use guard::{
    FailDescrId, FailureDescriptor, GuardCounter, GuardFailureManager, GuardState, ResumeGuard, ResumeGuardCounters,
    ResumeKind,
};
pub use history::{
    BoxRef, CompiledProcedure, DependencyId, GreenKey, History, OpCode, OpDescr, Operand, Operation, ProcedureToken,
    ProcedureTokenId, TargetId, TargetLabel, TokenRegistry, ValueMap,
};
pub use memmgr::MemoryManager;
pub use optimizer::{OptimizeOptions, Optimizer, SimpleOptimizer};
pub use warmstate::{
    AbortReason, BridgeTrace, CellCounter, CellTable, EntryOutcome, FailOutcome, JitCell, JitDriver, JitExit, LoopTrace,
    Tracer, WarmEnterState, MAX_CONSECUTIVE_ABORTS,
};
