// This module lowers a flow graph into the instruction set the jitcodes are made of. Calls
// are classified through CallControl and rewritten into inline, residual or recursive call
// instructions whose arguments are split into per-kind lists; every call and merge point is
// preceded by an empty `-live-` marker that the liveness pass fills in later. The portal's
// merge point gets its green and red arguments as six lists, `can_enter_jit` becomes
// `loop_header`, and field accesses and copies get kind-suffixed names. Finally a
// comparison whose only use is the condition of the block's two-way exit is fused into the
// branch, so flattening can emit a single `goto_if_not_<cmp>`.

//! Structural lowering of flow graphs.

use super::call::{CallControl, CallKind};
use super::descr::{CallDescr, Descr};
use super::flow::{Condition, Exit, FlowArg, FlowGraph, GraphId, SpaceOp, Variable};
use super::liveness::LIVE_MARKER;
use crate::core::{CompileError, CompileResult, Const, Kind};

/// Comparisons that may be fused into a conditional exit.
const FUSABLE_COMPARISONS: &[&str] = &[
    "int_lt",
    "int_le",
    "int_eq",
    "int_ne",
    "int_gt",
    "int_ge",
    "int_is_true",
    "int_is_zero",
    "ptr_eq",
    "ptr_ne",
    "ptr_nonzero",
    "ptr_iszero",
];

/// Lower a copy of `graph`. `portal_greens` is set when `graph` is the portal.
pub fn transform_graph(
    graph: &FlowGraph,
    callcontrol: &mut CallControl<'_>,
    portal_greens: Option<usize>,
) -> CompileResult<FlowGraph> {
    graph.check()?;
    let mut lowered = graph.clone();
    let mut transformer = Transformer {
        callcontrol,
        portal_greens,
        graph_name: &graph.name,
    };
    for block in &mut lowered.blocks {
        let mut operations = Vec::with_capacity(block.operations.len());
        for op in std::mem::take(&mut block.operations) {
            transformer.rewrite(op, &mut operations)?;
        }
        block.operations = operations;
        optimize_goto_if_not(&mut block.operations, &mut block.exit);
    }
    Ok(lowered)
}

struct Transformer<'t, 'p> {
    callcontrol: &'t mut CallControl<'p>,
    portal_greens: Option<usize>,
    graph_name: &'t str,
}

impl Transformer<'_, '_> {
    fn invalid(&self, reason: String) -> CompileError {
        CompileError::InvalidGraph {
            graph: self.graph_name.to_string(),
            reason,
        }
    }

    fn rewrite(&mut self, op: SpaceOp, out: &mut Vec<SpaceOp>) -> CompileResult<()> {
        match op.opname.as_str() {
            "direct_call" => self.rewrite_call(op, out),
            "jit_merge_point" => {
                let num_greens = self
                    .portal_greens
                    .ok_or_else(|| self.invalid("jit_merge_point outside the portal".into()))?;
                if op.args.len() < num_greens {
                    return Err(self.invalid(format!(
                        "jit_merge_point has {} arguments but {} greens",
                        op.args.len(),
                        num_greens
                    )));
                }
                let (greens, reds) = op.args.split_at(num_greens);
                let mut args = vec![FlowArg::Const(Const::Int(0))];
                args.extend(make_kind_lists(greens, "irf"));
                args.extend(make_kind_lists(reds, "irf"));
                out.push(SpaceOp::new(LIVE_MARKER, vec![], None));
                out.push(SpaceOp::new("jit_merge_point", args, None));
                Ok(())
            }
            "can_enter_jit" => {
                out.push(SpaceOp::new("loop_header", vec![FlowArg::Const(Const::Int(0))], None));
                Ok(())
            }
            "getfield" => {
                let kind = field_kind(&op.args, 1).ok_or_else(|| self.invalid("getfield without field descr".into()))?;
                out.push(SpaceOp::new(format!("getfield_gc_{}", kind.letter()), op.args, op.result));
                Ok(())
            }
            "setfield" => {
                let kind = field_kind(&op.args, 1).ok_or_else(|| self.invalid("setfield without field descr".into()))?;
                let mut args = op.args;
                if args.len() != 3 {
                    return Err(self.invalid("setfield takes object, descr and value".into()));
                }
                // obj, value, descr
                args.swap(1, 2);
                out.push(SpaceOp::new(format!("setfield_gc_{}", kind.letter()), args, None));
                Ok(())
            }
            "same_as" => {
                let kind = op
                    .result
                    .map(|v| v.kind)
                    .ok_or_else(|| self.invalid("same_as without result".into()))?;
                out.push(SpaceOp::new(format!("{}_copy", kind.name()), op.args, op.result));
                Ok(())
            }
            _ => {
                out.push(op);
                Ok(())
            }
        }
    }

    fn rewrite_call(&mut self, op: SpaceOp, out: &mut Vec<SpaceOp>) -> CompileResult<()> {
        let Some(FlowArg::Graph(callee)) = op.args.first().cloned() else {
            return Err(self.invalid("direct_call without a callee graph".into()));
        };
        let args = &op.args[1..];
        let result_letter = op.result.map_or('v', |v| v.kind.letter());
        let lowered = match self.callcontrol.guess_call_kind(callee) {
            CallKind::Regular => {
                let kinds = kinds_for(args);
                let jitcode = self.callcontrol.get_jitcode(callee);
                let mut lowered_args = vec![FlowArg::Descr(Descr::JitCode(jitcode))];
                lowered_args.extend(make_kind_lists(args, kinds));
                SpaceOp::new(format!("inline_call_{}_{}", kinds, result_letter), lowered_args, op.result)
            }
            CallKind::Residual => {
                let kinds = kinds_for(args);
                let descr = self.call_descr(callee, args, op.result)?;
                let mut lowered_args = vec![FlowArg::Descr(Descr::Call(descr))];
                lowered_args.extend(make_kind_lists(args, kinds));
                SpaceOp::new(format!("residual_call_{}_{}", kinds, result_letter), lowered_args, op.result)
            }
            CallKind::Recursive => {
                let num_greens = self
                    .callcontrol
                    .program()
                    .portal
                    .map_or(0, |p| p.num_greens)
                    .min(args.len());
                let (greens, reds) = args.split_at(num_greens);
                let mut lowered_args = vec![FlowArg::Const(Const::Int(0))];
                lowered_args.extend(make_kind_lists(greens, "irf"));
                lowered_args.extend(make_kind_lists(reds, "irf"));
                SpaceOp::new(format!("recursive_call_{}", result_letter), lowered_args, op.result)
            }
        };
        log::trace!("{}: {} lowered to {}", self.graph_name, op.opname, lowered.opname);
        out.push(SpaceOp::new(LIVE_MARKER, vec![], None));
        out.push(lowered);
        Ok(())
    }

    fn call_descr(&self, callee: GraphId, args: &[FlowArg], result: Option<Variable>) -> CompileResult<CallDescr> {
        let graph = self
            .callcontrol
            .program()
            .graph(callee)
            .ok_or_else(|| self.invalid(format!("call to unknown graph {}", callee.0)))?;
        let arg_kinds = args
            .iter()
            .map(|a| a.kind().ok_or_else(|| self.invalid(format!("call to {} with a non-value argument", graph.name))))
            .collect::<CompileResult<Vec<_>>>()?;
        Ok(CallDescr {
            name: graph.name.clone(),
            arg_kinds,
            result: result.map_or(Kind::Void, |v| v.kind),
        })
    }
}

fn field_kind(args: &[FlowArg], index: usize) -> Option<Kind> {
    match args.get(index) {
        Some(FlowArg::Descr(Descr::Field(field))) => Some(field.kind),
        _ => None,
    }
}

/// Smallest list layout covering the argument kinds: "r", "ir" or "irf".
fn kinds_for(args: &[FlowArg]) -> &'static str {
    if args.iter().any(|a| a.kind() == Some(Kind::Float)) {
        "irf"
    } else if args.iter().any(|a| a.kind() == Some(Kind::Int)) {
        "ir"
    } else {
        "r"
    }
}

fn make_kind_lists(args: &[FlowArg], kinds: &str) -> Vec<FlowArg> {
    kinds
        .chars()
        .filter_map(Kind::from_letter)
        .map(|kind| FlowArg::List {
            kind,
            items: args.iter().filter(|a| a.kind() == Some(kind)).cloned().collect(),
        })
        .collect()
}

/// Fuse the block's last comparison into its two-way exit.
fn optimize_goto_if_not(operations: &mut Vec<SpaceOp>, exit: &mut Exit) {
    let Exit::Branch { cond: Condition::Var(cond), .. } = exit else {
        return;
    };
    let cond = *cond;
    let Some(last) = operations.last() else {
        return;
    };
    if last.result != Some(cond) || !FUSABLE_COMPARISONS.contains(&last.opname.as_str()) {
        return;
    }
    // The condition must not also flow along a link.
    if exit.variables().iter().filter(|v| **v == cond).count() > 1 {
        return;
    }
    let Some(compare) = operations.pop() else {
        return;
    };
    if let Exit::Branch { cond, .. } = exit {
        *cond = Condition::Compare {
            opname: compare.opname,
            args: compare.args,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codewriter::descr::FieldDescr;
    use crate::codewriter::flow::{Link, Program};

    fn branch_graph(pass_cond: bool) -> FlowGraph {
        let mut g = FlowGraph::new("f", Kind::Int);
        let a = g.new_var(Kind::Int);
        let start = g.add_block(vec![a]);
        let c = g.new_var(Kind::Int);
        let t = g.new_var(Kind::Int);
        let yes = g.add_block(vec![t]);
        let e = g.new_var(Kind::Int);
        let no = g.add_block(vec![e]);
        g.push_op(start, SpaceOp::new("int_lt", vec![a.into(), Const::Int(10).into()], Some(c)));
        let carried = if pass_cond { c } else { a };
        g.set_exit(
            start,
            Exit::Branch {
                cond: Condition::Var(c),
                if_true: Link::new(yes, vec![carried.into()]),
                if_false: Link::new(no, vec![a.into()]),
            },
        );
        g.set_exit(yes, Exit::Return(Some(t.into())));
        g.set_exit(no, Exit::Return(Some(e.into())));
        g
    }

    #[test]
    fn test_comparison_is_fused_into_branch() {
        let program = Program::new();
        let mut cc = CallControl::new(&program);
        let lowered = transform_graph(&branch_graph(false), &mut cc, None).unwrap();
        assert!(lowered.blocks[0].operations.is_empty());
        let Exit::Branch { cond: Condition::Compare { opname, args }, .. } = &lowered.blocks[0].exit else {
            panic!("not fused");
        };
        assert_eq!(opname, "int_lt");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_comparison_used_on_a_link_is_kept() {
        let program = Program::new();
        let mut cc = CallControl::new(&program);
        let lowered = transform_graph(&branch_graph(true), &mut cc, None).unwrap();
        assert_eq!(lowered.blocks[0].operations.len(), 1);
        assert!(matches!(lowered.blocks[0].exit, Exit::Branch { cond: Condition::Var(_), .. }));
    }

    #[test]
    fn test_calls_are_split_into_kind_lists() {
        let mut program = Program::new();
        let mut callee = FlowGraph::new("callee", Kind::Int);
        let x = callee.new_var(Kind::Int);
        let b = callee.add_block(vec![x]);
        callee.set_exit(b, Exit::Return(Some(x.into())));
        let callee = program.add_graph(callee);

        let mut g = FlowGraph::new("caller", Kind::Int);
        let a = g.new_var(Kind::Int);
        let p = g.new_var(Kind::Ref);
        let start = g.add_block(vec![a, p]);
        let r = g.new_var(Kind::Int);
        g.push_op(
            start,
            SpaceOp::new("direct_call", vec![FlowArg::Graph(callee), p.into(), a.into()], Some(r)),
        );
        g.set_exit(start, Exit::Return(Some(r.into())));

        // Not a candidate: residual.
        let mut cc = CallControl::new(&program);
        let lowered = transform_graph(&g, &mut cc, None).unwrap();
        let ops = &lowered.blocks[0].operations;
        assert_eq!(ops[0].opname, LIVE_MARKER);
        assert_eq!(ops[1].opname, "residual_call_ir_i");
        assert_eq!(
            ops[1].args[0],
            FlowArg::Descr(Descr::Call(CallDescr {
                name: "callee".into(),
                arg_kinds: vec![Kind::Ref, Kind::Int],
                result: Kind::Int,
            }))
        );
        assert_eq!(ops[1].args[1], FlowArg::List { kind: Kind::Int, items: vec![a.into()] });
        assert_eq!(ops[1].args[2], FlowArg::List { kind: Kind::Ref, items: vec![p.into()] });
    }

    #[test]
    fn test_fields_and_merge_point() {
        let program = Program::new();
        let mut cc = CallControl::new(&program);
        let field = Descr::Field(FieldDescr {
            owner: "Frame".into(),
            name: "pc".into(),
            kind: Kind::Int,
        });
        let mut g = FlowGraph::new("portal", Kind::Void);
        let code = g.new_var(Kind::Ref);
        let frame = g.new_var(Kind::Ref);
        let start = g.add_block(vec![code, frame]);
        let pc = g.new_var(Kind::Int);
        g.push_op(start, SpaceOp::new("jit_merge_point", vec![code.into(), frame.into()], None));
        g.push_op(start, SpaceOp::new("getfield", vec![frame.into(), FlowArg::Descr(field.clone())], Some(pc)));
        g.push_op(
            start,
            SpaceOp::new("setfield", vec![frame.into(), FlowArg::Descr(field.clone()), pc.into()], None),
        );
        g.push_op(start, SpaceOp::new("can_enter_jit", vec![code.into(), frame.into()], None));

        let lowered = transform_graph(&g, &mut cc, Some(1)).unwrap();
        let names: Vec<&str> = lowered.blocks[0].operations.iter().map(|o| o.opname.as_str()).collect();
        assert_eq!(names, vec![LIVE_MARKER, "jit_merge_point", "getfield_gc_i", "setfield_gc_i", "loop_header"]);
        let merge = &lowered.blocks[0].operations[1];
        assert_eq!(merge.args.len(), 7);
        assert_eq!(merge.args[2], FlowArg::List { kind: Kind::Ref, items: vec![code.into()] });
        assert_eq!(merge.args[5], FlowArg::List { kind: Kind::Ref, items: vec![frame.into()] });
        assert_eq!(lowered.blocks[0].operations[3].args[2], FlowArg::Descr(field));

        assert!(transform_graph(&g, &mut cc, None).is_err());
    }
}
