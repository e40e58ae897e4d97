//! Property-based tests for call counting, guard value counters and
//! parameter strings.

use bumpalo::Bump;
use proptest::prelude::*;
use tracejit::codewriter::flatten::Operand as AsmOperand;
use tracejit::codewriter::jitcode::DecodedArg;
use tracejit::codewriter::{Assembler, Insn, SsaRepr};
use tracejit::core::{CompilationSession, Const, JitConfig, Kind, OptimizerLevel, Register, MAX_THRESHOLD, THRESHOLD_LIMIT};
use tracejit::metainterp::{
    BoxRef, CellCounter, JitCell, OpCode, Operand, Operation, ResumeGuardCounters, ValueMap,
};

fn arb_level() -> impl Strategy<Value = OptimizerLevel> {
    prop_oneof![
        Just(OptimizerLevel::Simple),
        Just(OptimizerLevel::NoPerfectSpecialization),
        Just(OptimizerLevel::Full),
    ]
}

/// An int operand: a register below 16 or a constant.
fn arb_int_operand() -> impl Strategy<Value = AsmOperand> {
    prop_oneof![
        (0u8..16).prop_map(|n| AsmOperand::Reg(Register::new(Kind::Int, n))),
        (-100_000i64..100_000).prop_map(|v| AsmOperand::Const(Const::Int(v))),
    ]
}

fn decoded(operand: &AsmOperand) -> DecodedArg {
    match operand {
        AsmOperand::Reg(reg) => DecodedArg::Reg(*reg),
        AsmOperand::Const(c) => DecodedArg::Const(*c),
        other => panic!("unexpected operand {:?}", other),
    }
}

proptest! {
    /// Assembling then decoding gives back every instruction and operand,
    /// and short integers never take a pool slot.
    #[test]
    fn assembled_code_decodes_back(
        insns in proptest::collection::vec((arb_int_operand(), arb_int_operand(), 0u8..16), 1..40)
    ) {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut asm = Assembler::new(&session);
        let mut ssa = SsaRepr::new("prop");
        for (a, b, res) in &insns {
            ssa.insns.push(Insn::op("int_add", vec![a.clone(), b.clone()], Some(Register::new(Kind::Int, *res))));
        }
        let jitcode = asm.assemble(&ssa).unwrap();
        prop_assert!(jitcode.constants_i.iter().all(|v| !(-128..=127).contains(v)));

        let decoded_insns = jitcode.decode(asm.insns()).unwrap();
        prop_assert_eq!(decoded_insns.len(), insns.len());
        for (insn, (a, b, res)) in decoded_insns.iter().zip(&insns) {
            prop_assert_eq!(&insn.opname, "int_add");
            prop_assert_eq!(&insn.args, &vec![decoded(a), decoded(b)]);
            prop_assert_eq!(insn.result, Some(Register::new(Kind::Int, *res)));
        }
    }

    /// A sixth distinct value never evicts the most frequent one.
    #[test]
    fn sixth_value_keeps_the_most_frequent(counts in proptest::collection::vec(1u32..20, 5)) {
        let mut counters = ResumeGuardCounters::new(0i64);
        for (value, count) in counts.iter().enumerate() {
            for _ in 0..*count {
                counters.see(value as i64 + 1);
            }
        }
        prop_assert_eq!(counters.see(99), 1);
        let max = counts.iter().copied().max().unwrap();
        let slots: Vec<(i64, u32)> = counters.slots().collect();
        prop_assert!(slots.iter().any(|(v, n)| *v != 99 && *n == max));
        prop_assert!(slots.contains(&(99, 1)));
    }

    /// A cell starts tracing on exactly the `threshold`-th call.
    #[test]
    fn cell_crosses_on_threshold_call(threshold in 1i64..5000) {
        let config = JitConfig { threshold, ..JitConfig::default() };
        let increment = config.increment_threshold();
        let mut cell = JitCell::default();
        for call in 1..threshold {
            prop_assert!(!cell.tick(increment), "crossed early on call {}", call);
        }
        prop_assert!(cell.tick(increment));
        prop_assert!(matches!(cell.counter, CellCounter::Counting(_)));
    }

    /// Over the whole accepted range, `threshold - 1` increments stay at or
    /// below the limit and `threshold` increments go past it.
    #[test]
    fn increment_is_exact_for_every_threshold(threshold in 1i64..=MAX_THRESHOLD) {
        let config = JitConfig { threshold, ..JitConfig::default() };
        let increment = config.increment_threshold() as u128;
        let limit = THRESHOLD_LIMIT as u128;
        prop_assert!((threshold as u128 - 1) * increment <= limit);
        prop_assert!(threshold as u128 * increment > limit);
    }

    /// With at most five distinct values every value is counted exactly.
    #[test]
    fn few_values_are_counted_exactly(seq in proptest::collection::vec(0i64..5, 1..200)) {
        let mut counters = ResumeGuardCounters::new(0i64);
        let mut expected = [0u32; 5];
        for value in seq {
            expected[value as usize] += 1;
            prop_assert_eq!(counters.see(value), expected[value as usize]);
        }
    }

    /// Never more than five slots, and the value just seen always has one.
    #[test]
    fn counters_keep_the_latest_value(seq in proptest::collection::vec(-20i64..20, 1..300)) {
        let mut counters = ResumeGuardCounters::new(0i64);
        for value in seq {
            let count = counters.see(value);
            prop_assert!(count >= 1);
            let slots: Vec<(i64, u32)> = counters.slots().collect();
            prop_assert!(slots.len() <= 5);
            prop_assert!(slots.contains(&(value, count)));
        }
    }

    /// Parameter strings are applied all or nothing.
    #[test]
    fn user_params_apply_atomically(
        threshold in -5i64..100_000,
        eagerness in 0u32..1000,
        longevity in 0u64..5000,
        level in arb_level(),
        bogus in any::<bool>(),
    ) {
        let mut text = format!(
            "threshold={},trace_eagerness={},optimizer={},loop_longevity={}",
            threshold, eagerness, level, longevity
        );
        if bogus {
            text.push_str(",nonsense=1");
        }
        let mut config = JitConfig::default();
        let result = config.set_user_param(&text);
        if bogus {
            prop_assert!(result.is_err());
            prop_assert_eq!(config, JitConfig::default());
        } else {
            prop_assert!(result.is_ok());
            prop_assert_eq!(config.threshold, threshold);
            prop_assert_eq!(config.trace_eagerness, eagerness);
            prop_assert_eq!(config.optimizer, level);
            prop_assert_eq!(config.loop_longevity, longevity);
        }
    }

    /// Inlined results never collide with boxes of the original procedure.
    #[test]
    fn inlined_results_are_fresh(ops in 1usize..40, first_free in 0u32..8) {
        let i0 = BoxRef { id: 0, kind: Kind::Int };
        let mut body = Vec::new();
        let mut last = i0;
        for n in 0..ops {
            let result = BoxRef { id: n as u32 + 1, kind: Kind::Int };
            body.push(Operation::new(OpCode::IntAdd, vec![last.into(), Operand::Box(i0)], Some(result)));
            last = result;
        }
        let floor = first_free.max(ops as u32 + 1);
        let mut map = ValueMap::new(&[i0.into()], &[last.into()], floor);
        for op in &body {
            let inlined = map.inline_op(op);
            let fresh = inlined.result.unwrap();
            prop_assert!(fresh.id >= floor);
            prop_assert_ne!(inlined.args[1], Operand::Box(i0));
        }
        prop_assert_eq!(map.next_free_box(), floor + ops as u32);
    }
}
