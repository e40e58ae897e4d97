// This module implements failure descriptors and the per-guard counting that decides
// between compiling a bridge and replaying in the blackhole interpreter. Every guard and
// FINISH of a compiled procedure carries a FailDescrId into the GuardFailureManager arena.
// Descriptors that end the frame (done-with-frame per result kind, exit with exception)
// are shared and created once. A resume guard counts its failures with a plain counter
// compared against trace_eagerness, unless the guard is a GUARD_VALUE whose box is among
// its fail args: then it counts per observed value in a five-slot table, so a bridge is
// only compiled for a value that keeps coming back. When the table is full the slot with
// the third highest count is overwritten, which tends to keep the two most frequent
// values while not always evicting the newest one.

//! Failure descriptors and guard failure counters.

use super::backend::Backend;
use super::history::{GreenKey, OpCode, Operation, ProcedureTokenId};
use crate::core::{GcRef, Kind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FailDescrId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    Plain,
    /// Attached to GUARD_NOT_INVALIDATED.
    NotInvalidated,
    /// Attached to GUARD_NOT_FORCED; never compiles a bridge.
    Forced,
    /// Resumes at a fixed position; its bridges do not inline the short preamble.
    AtPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Unseen,
    Counting,
    Bridged,
}

/// Five (value, count) slots; see [`ResumeGuardCounters::see`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeGuardCounters<T> {
    counters: [u32; 5],
    values: [T; 5],
}

impl<T: Copy + PartialEq> ResumeGuardCounters<T> {
    pub fn new(zero: T) -> Self {
        Self {
            counters: [0; 5],
            values: [zero; 5],
        }
    }

    /// Count one more occurrence of `value` and return its count.
    pub fn see(&mut self, value: T) -> u32 {
        let mut unused = None;
        for i in 0..5 {
            let cnt = self.counters[i];
            if cnt != 0 {
                if self.values[i] == value {
                    self.counters[i] = cnt + 1;
                    return cnt + 1;
                }
            } else {
                unused = Some(i);
            }
        }
        if let Some(i) = unused {
            self.counters[i] = 1;
            self.values[i] = value;
            return 1;
        }
        // Overwrite the third highest slot: a, b, c rank first, second and third.
        let mut a = 0;
        let mut b: Option<usize> = None;
        let mut c: Option<usize> = None;
        for i in 1..5 {
            let n = self.counters[i];
            if n > self.counters[a] {
                c = b;
                b = Some(a);
                a = i;
            } else if b.map_or(true, |b| n > self.counters[b]) {
                c = b;
                b = Some(i);
            } else if c.map_or(true, |c| n > self.counters[c]) {
                c = Some(i);
            }
        }
        let c = c.unwrap_or(4);
        self.counters[c] = 1;
        self.values[c] = value;
        1
    }

    pub fn slots(&self) -> impl Iterator<Item = (T, u32)> + '_ {
        self.values
            .iter()
            .copied()
            .zip(self.counters.iter().copied())
            .filter(|(_, n)| *n != 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueCounters {
    Int(ResumeGuardCounters<i64>),
    Ref(ResumeGuardCounters<GcRef>),
    /// Keyed by bit pattern: NaN matches itself and `-0.0` differs from `0.0`.
    Float(ResumeGuardCounters<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCounter {
    /// Failures seen so far.
    Simple(u32),
    /// Count per value of the fail arg at `index`.
    PerValue { kind: Kind, index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeGuard {
    pub kind: ResumeKind,
    pub counter: GuardCounter,
    pub counters: Option<ValueCounters>,
    /// Token of the procedure the guard lives in, set when it reaches the backend.
    pub original_token: Option<ProcedureTokenId>,
    pub bridged: bool,
    /// Set while a bridge from this guard is being traced or compiled.
    pub busy: bool,
}

impl ResumeGuard {
    pub fn new(kind: ResumeKind) -> Self {
        Self {
            kind,
            counter: GuardCounter::Simple(0),
            counters: None,
            original_token: None,
            bridged: false,
            busy: false,
        }
    }

    pub fn state(&self) -> GuardState {
        if self.bridged {
            GuardState::Bridged
        } else if self.counter == GuardCounter::Simple(0) && self.counters.is_none() {
            GuardState::Unseen
        } else {
            GuardState::Counting
        }
    }

    /// Switch to per-value counting if the GUARD_VALUE's box is among the fail args.
    pub fn make_a_counter_per_value(&mut self, guard_value_op: &Operation) {
        debug_assert_eq!(guard_value_op.opcode, OpCode::GuardValue);
        let Some(guarded) = guard_value_op.args.first().and_then(|a| a.as_box()) else {
            return;
        };
        let Some(index) = guard_value_op.fail_args.iter().position(|a| a.as_box() == Some(guarded)) else {
            return;
        };
        if guarded.kind == Kind::Void {
            return;
        }
        self.counter = GuardCounter::PerValue {
            kind: guarded.kind,
            index,
        };
    }

    /// Record one failure; true when a bridge should be compiled now.
    pub fn must_compile(&mut self, backend: &dyn Backend, trace_eagerness: u32) -> bool {
        // An outer invocation is already compiling from this guard.
        if self.busy {
            return false;
        }
        match self.counter {
            GuardCounter::Simple(n) => {
                let n = n.saturating_add(1);
                self.counter = GuardCounter::Simple(n);
                n >= trace_eagerness
            }
            GuardCounter::PerValue { kind, index } => {
                let seen = match (kind, &mut self.counters) {
                    (Kind::Int, Some(ValueCounters::Int(c))) => c.see(backend.latest_value_int(index)),
                    (Kind::Ref, Some(ValueCounters::Ref(c))) => c.see(backend.latest_value_ref(index)),
                    (Kind::Float, Some(ValueCounters::Float(c))) => c.see(backend.latest_value_float(index).to_bits()),
                    (Kind::Int, _) => {
                        let mut c = ResumeGuardCounters::new(0i64);
                        let n = c.see(backend.latest_value_int(index));
                        self.counters = Some(ValueCounters::Int(c));
                        n
                    }
                    (Kind::Ref, _) => {
                        let mut c = ResumeGuardCounters::new(GcRef::NULL);
                        let n = c.see(backend.latest_value_ref(index));
                        self.counters = Some(ValueCounters::Ref(c));
                        n
                    }
                    (Kind::Float, _) => {
                        let mut c = ResumeGuardCounters::new(0u64);
                        let n = c.see(backend.latest_value_float(index).to_bits());
                        self.counters = Some(ValueCounters::Float(c));
                        n
                    }
                    (Kind::Void, _) => 0,
                };
                seen >= trace_eagerness
            }
        }
    }

    /// Forget the counts after a bridge attempt was given up.
    pub fn reset_counter_from_failure(&mut self) {
        if let GuardCounter::Simple(_) = self.counter {
            self.counter = GuardCounter::Simple(0);
        }
        self.counters = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureDescriptor {
    /// FINISH of a frame returning a value of this kind.
    DoneWithFrame(Kind),
    /// FINISH of a frame raising the exception in fail arg 0.
    ExitWithException,
    GuardResume(ResumeGuard),
    /// Guards of an entry bridge traced from the interpreter.
    ResumeFromInterpreter { greenkey: GreenKey },
    /// GUARD_NO_EXCEPTION of a temporary callback procedure.
    PropagateException,
}

/// Arena of failure descriptors.
#[derive(Debug)]
pub struct GuardFailureManager {
    descrs: Vec<FailureDescriptor>,
}

const DONE_KINDS: [Kind; 4] = [Kind::Void, Kind::Int, Kind::Ref, Kind::Float];
const EXIT_WITH_EXCEPTION: FailDescrId = FailDescrId(4);

impl Default for GuardFailureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardFailureManager {
    pub fn new() -> Self {
        let mut descrs: Vec<FailureDescriptor> = DONE_KINDS.iter().map(|k| FailureDescriptor::DoneWithFrame(*k)).collect();
        descrs.push(FailureDescriptor::ExitWithException);
        Self { descrs }
    }

    fn push(&mut self, descr: FailureDescriptor) -> FailDescrId {
        self.descrs.push(descr);
        FailDescrId(self.descrs.len() as u32 - 1)
    }

    /// Shared descriptor for a FINISH returning `kind`.
    pub fn done_with_frame(&self, kind: Kind) -> FailDescrId {
        let index = DONE_KINDS.iter().position(|k| *k == kind).unwrap_or(0);
        FailDescrId(index as u32)
    }

    pub fn exit_frame_with_exception(&self) -> FailDescrId {
        EXIT_WITH_EXCEPTION
    }

    pub fn new_resume_guard(&mut self, kind: ResumeKind) -> FailDescrId {
        self.push(FailureDescriptor::GuardResume(ResumeGuard::new(kind)))
    }

    pub fn new_resume_from_interp(&mut self, greenkey: GreenKey) -> FailDescrId {
        self.push(FailureDescriptor::ResumeFromInterpreter { greenkey })
    }

    pub fn new_propagate_exception(&mut self) -> FailDescrId {
        self.push(FailureDescriptor::PropagateException)
    }

    pub fn get(&self, id: FailDescrId) -> Option<&FailureDescriptor> {
        self.descrs.get(id.0 as usize)
    }

    pub fn resume_guard(&self, id: FailDescrId) -> Option<&ResumeGuard> {
        match self.descrs.get(id.0 as usize) {
            Some(FailureDescriptor::GuardResume(guard)) => Some(guard),
            _ => None,
        }
    }

    pub fn resume_guard_mut(&mut self, id: FailDescrId) -> Option<&mut ResumeGuard> {
        match self.descrs.get_mut(id.0 as usize) {
            Some(FailureDescriptor::GuardResume(guard)) => Some(guard),
            _ => None,
        }
    }

    /// Whether `id` is a resume descriptor that records its original token.
    pub fn is_resume_descr(&self, id: FailDescrId) -> bool {
        matches!(
            self.get(id),
            Some(FailureDescriptor::GuardResume(_)) | Some(FailureDescriptor::ResumeFromInterpreter { .. })
        )
    }

    pub fn set_original_token(&mut self, id: FailDescrId, token: ProcedureTokenId) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.original_token = Some(token);
        }
    }

    pub fn make_a_counter_per_value(&mut self, id: FailDescrId, guard_value_op: &Operation) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.make_a_counter_per_value(guard_value_op);
        }
    }

    pub fn must_compile(&mut self, id: FailDescrId, backend: &dyn Backend, trace_eagerness: u32) -> bool {
        match self.resume_guard_mut(id) {
            Some(guard) if guard.kind != ResumeKind::Forced => guard.must_compile(backend, trace_eagerness),
            _ => false,
        }
    }

    /// No effect on descriptors other than resume guards.
    pub fn reset_counter_from_failure(&mut self, id: FailDescrId) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.reset_counter_from_failure();
        }
    }

    pub fn start_compiling(&mut self, id: FailDescrId) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.busy = true;
        }
    }

    pub fn done_compiling(&mut self, id: FailDescrId) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.busy = false;
        }
    }

    pub fn mark_bridged(&mut self, id: FailDescrId) {
        if let Some(guard) = self.resume_guard_mut(id) {
            guard.bridged = true;
        }
    }

    pub fn len(&self) -> usize {
        self.descrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_see_counts_repeated_values() {
        let mut c = ResumeGuardCounters::new(0i64);
        assert_eq!(c.see(7), 1);
        assert_eq!(c.see(7), 2);
        assert_eq!(c.see(8), 1);
        assert_eq!(c.see(7), 3);
    }

    #[test]
    fn test_see_evicts_third_highest() {
        let mut c = ResumeGuardCounters::new(0i64);
        // counts: 10 -> 5, 20 -> 4, 30 -> 3, 40 -> 2, 50 -> 1
        for (value, times) in [(10, 5), (20, 4), (30, 3), (40, 2), (50, 1)] {
            for _ in 0..times {
                c.see(value);
            }
        }
        assert_eq!(c.see(60), 1);
        let values: Vec<i64> = c.slots().map(|(v, _)| v).collect();
        assert!(values.contains(&10));
        assert!(values.contains(&20));
        assert!(!values.contains(&30));
        assert!(values.contains(&60));
    }

    #[test]
    fn test_unused_slot_is_the_last_free_one() {
        let mut c = ResumeGuardCounters::new(0i64);
        c.see(1);
        // Slot 4 was the last free slot scanned.
        assert_eq!(c.values[4], 1);
        assert_eq!(c.counters, [0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_shared_descriptors() {
        let mut mgr = GuardFailureManager::new();
        assert_eq!(mgr.get(mgr.done_with_frame(Kind::Int)), Some(&FailureDescriptor::DoneWithFrame(Kind::Int)));
        assert_eq!(mgr.get(mgr.exit_frame_with_exception()), Some(&FailureDescriptor::ExitWithException));
        let g = mgr.new_resume_guard(ResumeKind::Plain);
        assert_eq!(g, FailDescrId(5));
        assert_eq!(mgr.resume_guard(g).unwrap().state(), GuardState::Unseen);
        mgr.mark_bridged(g);
        assert_eq!(mgr.resume_guard(g).unwrap().state(), GuardState::Bridged);
    }
}
