// This module is the central hub for the JIT's shared infrastructure, the building blocks
// used by both the codewriter and the metainterp. It exports the value model (kinds, GC
// references, runtime values and compile-time constants), the error taxonomy built on
// thiserror, the JIT parameter set with its string parser, arena-based compilation
// sessions with statistics, per-kind register slot bookkeeping over 256-bit sets, and the
// IrAdaptor/Analyzer pair that computes block order and liveness over flow graphs.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Values (`value`)
//! - `Kind`, `GcRef`, `Value` and `Const`
//!
//! ## Configuration (`config`)
//! - `JitConfig` with the recognised parameters and `name=value` parsing
//!
//! ## Session Management (`session`)
//! - Arena-based interning using `bumpalo`
//! - Assembly statistics
//!
//! ## Register Slots (`register_file`)
//! - Lowest-free slot allocation per kind, bounded at 256
//!
//! ## Analysis (`adaptor`, `analyzer`)
//! - Reverse post-order and per-operation liveness over flow graphs

pub mod adaptor;
pub mod analyzer;
pub mod config;
pub mod error;
pub mod register_file;
pub mod session;
pub mod test_utils;
pub mod value;

pub use adaptor::IrAdaptor;
pub use analyzer::{Analyzer, BlockLiveness};
pub use config::{JitConfig, OptimizerLevel, MAX_THRESHOLD, THRESHOLD_LIMIT};
pub use error::{CompileError, CompileResult, ConfigError, InvalidLoop, JitError};
pub use register_file::{RegAllocError, RegBitSet, Register, RegisterFile, SLOTS_PER_BANK};
pub use session::{CompilationSession, SessionStats};
pub use value::{Const, GcRef, Kind, Value, REGISTER_KINDS};
