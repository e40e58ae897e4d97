// This module defines the error types of the JIT using the thiserror crate. CompileError
// covers fatal internal failures of the codewriter and the compilation pipeline: an
// unencodable jitcode (registers plus constants of one kind above 256), unresolved or
// out-of-range labels, operand lists or descriptor tables that outgrow their encoding,
// malformed flow graphs, register allocation failures and backend rejections. InvalidLoop
// is the recoverable verdict of the optimizer; it aborts one compilation attempt and is
// never surfaced to the host. JitError is what the warm entry state reports to the host
// when the force/save protocol is violated or an unexpected descriptor reaches it, and
// ConfigError reports bad JIT parameter strings. CompileResult<T> is the convenience alias.

//! Error types for the trace compiler.

use super::value::Kind;
use thiserror::Error;

/// Fatal internal errors of the codewriter and compilation pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{kind} registers ({registers}) plus constants ({constants}) exceed 256")]
    EncodingOverflow {
        kind: Kind,
        registers: usize,
        constants: usize,
    },

    #[error("Label {name} is referenced but never defined")]
    UnresolvedLabel { name: String },

    #[error("Label {name} at offset {offset} does not fit in two bytes")]
    LabelOutOfRange { name: String, offset: usize },

    #[error("Operand list of {len} items exceeds 255")]
    ListTooLong { len: usize },

    #[error("Too many descriptors in one compilation unit")]
    TooManyDescrs,

    #[error("Too many distinct instruction shapes in one compilation unit")]
    TooManyOpcodes,

    #[error("Expected a {expected} operand, found {found}")]
    KindMismatch { expected: Kind, found: Kind },

    #[error("Register allocation failed: {reason}")]
    RegisterAllocation { reason: String },

    #[error("Invalid flow graph {graph}: {reason}")]
    InvalidGraph { graph: String, reason: String },

    #[error("Unsupported operand in {context}: {operand}")]
    UnsupportedOperand { context: String, operand: String },

    #[error("Listing parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Malformed trace: {reason}")]
    MalformedTrace { reason: String },

    #[error("Guard {op_index} reached the backend without a failure descriptor")]
    MissingFailDescr { op_index: usize },

    #[error("Backend error: {reason}")]
    Backend { reason: String },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// The optimizer found a contradiction in the trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid loop: {reason}")]
pub struct InvalidLoop {
    pub reason: String,
}

impl InvalidLoop {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the warm entry state to the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JitError {
    #[error("No deferred state saved for force token {token:#x}")]
    MissingForceToken { token: usize },

    #[error("Deferred state for force token {token:#x} saved twice")]
    DuplicateForceToken { token: usize },

    #[error("Unexpected failure descriptor: {reason}")]
    UnexpectedDescr { reason: String },

    #[error("Frame finished with a {found} result, driver expects {expected}")]
    ResultKindMismatch { expected: Kind, found: Kind },

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Errors from parsing JIT parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown JIT parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Unknown optimizer: {name}")]
    UnknownOptimizer { name: String },

    #[error("Threshold {value} above the maximum of {max}")]
    ThresholdTooLarge { value: i64, max: i64 },
}
