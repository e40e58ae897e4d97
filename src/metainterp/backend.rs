//! Backend interface.
//!
//! The backend turns compiled procedures into machine code and runs them.
//! Procedures are addressed by their token, guards by their failure
//! descriptor id. After `execute_token` returns, the values saved by the
//! failing guard (or passed to FINISH) are read back through the
//! `latest_value_*` accessors, indexed by position in the fail args.

use super::context::ForceToken;
use super::guard::FailDescrId;
use super::history::{BoxRef, CompiledProcedure, Operation, ProcedureTokenId};
use crate::core::{CompileResult, GcRef, Kind, Value};

pub trait Backend {
    /// Compile a loop or entry procedure under `token`.
    fn compile_loop(&mut self, token: ProcedureTokenId, procedure: &CompiledProcedure, name: &str) -> CompileResult<()>;

    /// Compile a bridge leaving the guard that owns `faildescr`.
    fn compile_bridge(
        &mut self,
        faildescr: FailDescrId,
        inputargs: &[BoxRef],
        operations: &[Operation],
        original_token: ProcedureTokenId,
    ) -> CompileResult<()>;

    /// Backend-side number of a failure descriptor.
    fn get_fail_descr_number(&mut self, faildescr: FailDescrId) -> u32;

    /// Make CALL_ASSEMBLERs to `old` call `new` instead.
    fn redirect_call_assembler(&mut self, old: ProcedureTokenId, new: ProcedureTokenId);

    /// Run the procedure of `token` until a guard fails or it finishes.
    fn execute_token(&mut self, token: ProcedureTokenId, args: &[Value]) -> FailDescrId;

    fn latest_value_int(&self, index: usize) -> i64;
    fn latest_value_ref(&self, index: usize) -> GcRef;
    fn latest_value_float(&self, index: usize) -> f64;

    fn latest_value(&self, index: usize, kind: Kind) -> Value {
        match kind {
            Kind::Int => Value::Int(self.latest_value_int(index)),
            Kind::Ref => Value::Ref(self.latest_value_ref(index)),
            Kind::Float => Value::Float(self.latest_value_float(index)),
            Kind::Void => Value::Void,
        }
    }

    /// Forget the first `count` saved values so they are no longer GC roots.
    fn clear_latest_values(&mut self, count: usize);

    /// Take the pending exception of the last run.
    fn grab_exc_value(&mut self) -> GcRef;

    /// Force token of the frame whose GUARD_NOT_FORCED failed.
    fn get_latest_force_token(&self) -> ForceToken;

    /// Force the frame identified by `token`; returns its GUARD_NOT_FORCED descriptor.
    fn force(&mut self, token: ForceToken) -> FailDescrId;

    /// Make GUARD_NOT_INVALIDATED fail in every procedure of `token`.
    fn invalidate_loop(&mut self, token: ProcedureTokenId);

    /// Release the machine code of a retired token.
    fn free_loop(&mut self, _token: ProcedureTokenId) {}
}
