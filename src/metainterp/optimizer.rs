//! Optimizer interface.
//!
//! The trace optimizer is an external collaborator. It receives a
//! procedure starting with a LABEL and returns the optimized procedure,
//! or [`InvalidLoop`] when it proves the trace can never run as
//! recorded. A result that ends in a LABEL means a preamble was peeled
//! off: the loop compiler then inlines the body once more behind that
//! label and optimizes again.

use super::history::{CompiledProcedure, OpCode, Operand, TokenRegistry};
use crate::core::{Const, InvalidLoop, OptimizerLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeOptions {
    pub level: OptimizerLevel,
    /// False for bridges resuming at a fixed position.
    pub inline_short_preamble: bool,
}

impl OptimizeOptions {
    pub fn new(level: OptimizerLevel) -> Self {
        Self {
            level,
            inline_short_preamble: true,
        }
    }
}

pub trait Optimizer {
    fn optimize_trace(
        &mut self,
        procedure: CompiledProcedure,
        options: &OptimizeOptions,
        registry: &mut TokenRegistry,
    ) -> Result<CompiledProcedure, InvalidLoop>;
}

/// Keeps operations as recorded, rejecting only guards that fail on constants.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleOptimizer;

impl Optimizer for SimpleOptimizer {
    fn optimize_trace(
        &mut self,
        procedure: CompiledProcedure,
        _options: &OptimizeOptions,
        _registry: &mut TokenRegistry,
    ) -> Result<CompiledProcedure, InvalidLoop> {
        for op in &procedure.operations {
            let always_fails = match (op.opcode, op.args.first()) {
                (OpCode::GuardTrue, Some(Operand::Const(Const::Int(0)))) => true,
                (OpCode::GuardFalse, Some(Operand::Const(Const::Int(v)))) => *v != 0,
                (OpCode::GuardValue, Some(Operand::Const(a))) => {
                    matches!(op.args.get(1), Some(Operand::Const(b)) if a != b)
                }
                _ => false,
            };
            if always_fails {
                return Err(InvalidLoop::new(format!("{} can never pass", op)));
            }
        }
        Ok(procedure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainterp::history::Operation;

    #[test]
    fn test_constant_failing_guard_is_invalid() {
        let mut registry = TokenRegistry::new();
        let ok = CompiledProcedure::new(
            "ok",
            vec![],
            vec![Operation::new(OpCode::GuardTrue, vec![Const::Int(1).into()], None)],
        );
        let bad = CompiledProcedure::new(
            "bad",
            vec![],
            vec![Operation::new(OpCode::GuardValue, vec![Const::Int(1).into(), Const::Int(2).into()], None)],
        );
        let options = OptimizeOptions::new(OptimizerLevel::Simple);
        assert!(SimpleOptimizer.optimize_trace(ok, &options, &mut registry).is_ok());
        assert!(SimpleOptimizer.optimize_trace(bad, &options, &mut registry).is_err());
    }
}
