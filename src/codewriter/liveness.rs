//! Filling of `-live-` markers.
//!
//! Lowering places an empty `-live-` marker in front of every operation
//! that may call out of the jitcode (calls, merge points). This pass fills
//! each marker with the variables that must survive that operation: those
//! live after it, minus its own result. The assembler later turns the
//! registers into the jitcode's liveness table for root scanning.

use super::flow::{FlowArg, FlowGraph, GraphAdaptor, Variable};
use crate::core::Analyzer;

pub const LIVE_MARKER: &str = "-live-";

/// Fill every `-live-` marker of `graph` in place.
pub fn compute_liveness(graph: &mut FlowGraph) {
    let mut fills: Vec<(usize, usize, Vec<Variable>)> = Vec::new();
    {
        let mut adaptor = GraphAdaptor::single(graph);
        let mut analyzer = Analyzer::new();
        analyzer.switch_func(&mut adaptor, 0);

        for &block_id in analyzer.order() {
            let Some(live) = analyzer.block_liveness(block_id) else {
                continue;
            };
            let block = graph.block(block_id);
            for (pos, op) in block.operations.iter().enumerate() {
                if op.opname != LIVE_MARKER {
                    continue;
                }
                let covered = pos + 1;
                let (set, result) = match block.operations.get(covered) {
                    Some(next) => (live.live_after(covered), next.result),
                    None => (live.live_out(), None),
                };
                let mut vars: Vec<Variable> = set.iter().copied().filter(|v| Some(*v) != result).collect();
                vars.sort_by_key(|v| (v.kind, v.id));
                fills.push((block_id.0 as usize, pos, vars));
            }
        }
    }

    for (block, pos, vars) in fills {
        graph.blocks[block].operations[pos].args = vars.into_iter().map(FlowArg::Var).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codewriter::flow::{Exit, SpaceOp};
    use crate::core::Kind;

    #[test]
    fn test_marker_lists_values_surviving_the_call() {
        let mut g = FlowGraph::new("f", Kind::Int);
        let a = g.new_var(Kind::Int);
        let b = g.new_var(Kind::Int);
        let p = g.new_var(Kind::Ref);
        let start = g.add_block(vec![a, b, p]);
        let r = g.new_var(Kind::Int);
        let s = g.new_var(Kind::Int);
        g.push_op(start, SpaceOp::new(LIVE_MARKER, vec![], None));
        g.push_op(start, SpaceOp::new("residual_call", vec![a.into()], Some(r)));
        g.push_op(start, SpaceOp::new("int_add", vec![r.into(), b.into()], Some(s)));
        g.set_exit(start, Exit::Return(Some(s.into())));

        compute_liveness(&mut g);
        let marker = &g.blocks[0].operations[0];
        // `a` dies at the call, `r` is its result, `p` is never used.
        assert_eq!(marker.args, vec![FlowArg::Var(b)]);
    }
}
