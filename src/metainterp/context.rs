// This module implements the execution context shared by the compiled code, the warm
// entry state and the guard failure handlers. It replaces a process-wide table: the
// virtuals forced while compiled code is suspended in a residual call are saved here under
// the frame's force token and fetched exactly once when the frame's GUARD_NOT_FORCED fails
// later. The context also tracks the non-preemptible region around force-then-save; hosts
// query is_preemptible() before delivering interrupts or reporting stack exhaustion, so no
// observation point can fall between forcing the frame and saving its virtuals.

//! Deferred forced state and the force critical section.

use crate::core::{JitError, Value};
use hashbrown::HashMap;
use std::cell::Cell;
use std::rc::Rc;

/// Identity of a frame of compiled code that may be forced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ForceToken(pub usize);

#[derive(Debug, Default)]
pub struct ExecutionContext {
    deferred: HashMap<ForceToken, Vec<Value>>,
    critical: Rc<Cell<u32>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the forced virtuals of `token`; each token is saved at most once.
    pub fn save_data(&mut self, token: ForceToken, virtuals: Vec<Value>) -> Result<(), JitError> {
        if self.deferred.contains_key(&token) {
            return Err(JitError::DuplicateForceToken { token: token.0 });
        }
        self.deferred.insert(token, virtuals);
        Ok(())
    }

    /// Remove and return the virtuals saved for `token`.
    pub fn fetch_data(&mut self, token: ForceToken) -> Result<Vec<Value>, JitError> {
        self.deferred
            .remove(&token)
            .ok_or(JitError::MissingForceToken { token: token.0 })
    }

    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    /// Enter a non-preemptible region, left when the guard drops.
    pub fn critical_section(&self) -> CriticalSection {
        self.critical.set(self.critical.get() + 1);
        CriticalSection {
            depth: Rc::clone(&self.critical),
        }
    }

    pub fn is_preemptible(&self) -> bool {
        self.critical.get() == 0
    }
}

/// RAII guard of [`ExecutionContext::critical_section`].
#[must_use]
pub struct CriticalSection {
    depth: Rc<Cell<u32>>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_is_fetched_exactly_once() {
        let mut ctx = ExecutionContext::new();
        let token = ForceToken(0x40);
        ctx.save_data(token, vec![Value::Int(3)]).unwrap();
        assert_eq!(
            ctx.save_data(token, vec![]),
            Err(JitError::DuplicateForceToken { token: 0x40 })
        );
        assert_eq!(ctx.fetch_data(token).unwrap(), vec![Value::Int(3)]);
        assert_eq!(ctx.fetch_data(token), Err(JitError::MissingForceToken { token: 0x40 }));
    }

    #[test]
    fn test_critical_sections_nest() {
        let ctx = ExecutionContext::new();
        assert!(ctx.is_preemptible());
        {
            let _outer = ctx.critical_section();
            {
                let _inner = ctx.critical_section();
                assert!(!ctx.is_preemptible());
            }
            assert!(!ctx.is_preemptible());
        }
        assert!(ctx.is_preemptible());
    }
}
