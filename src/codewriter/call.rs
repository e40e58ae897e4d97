// This module decides which graphs the codewriter turns into jitcodes and how each call
// site is lowered. CallControl walks the call graph breadth-first from the portal, asking
// the JitPolicy whether to look inside every `direct_call` target; graphs accepted by the
// policy become candidates and get their own jitcode, calls to the portal are recursive
// (they go through the portal's assembler token at run time), and everything else is a
// residual call into separately compiled code. Jitcode ids are handed out lazily by
// get_jitcode, which also queues the graph so the codewriter can drain the queue in order.

//! Call-graph exploration and call classification.

use super::descr::JitCodeId;
use super::flow::{FlowArg, FlowGraph, GraphId, Program};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

/// How a `direct_call` is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// The callee gets a jitcode and is traced through.
    Regular,
    /// The callee is called as opaque compiled code.
    Residual,
    /// A call back into the portal.
    Recursive,
}

/// Decides which graphs are traced through.
pub trait JitPolicy {
    fn look_inside_graph(&self, graph: &FlowGraph) -> bool;
}

/// Looks inside every graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl JitPolicy for DefaultPolicy {
    fn look_inside_graph(&self, _graph: &FlowGraph) -> bool {
        true
    }
}

/// Policy that refuses graphs by name.
#[derive(Debug, Clone, Default)]
pub struct OpaquePolicy {
    pub opaque: HashSet<String>,
}

impl JitPolicy for OpaquePolicy {
    fn look_inside_graph(&self, graph: &FlowGraph) -> bool {
        !self.opaque.contains(&graph.name)
    }
}

pub struct CallControl<'p> {
    program: &'p Program,
    candidate_graphs: HashSet<GraphId>,
    jitcodes: HashMap<GraphId, JitCodeId>,
    pending: VecDeque<(GraphId, JitCodeId)>,
    next_id: u32,
}

impl<'p> CallControl<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            candidate_graphs: HashSet::new(),
            jitcodes: HashMap::new(),
            pending: VecDeque::new(),
            next_id: 0,
        }
    }

    pub fn program(&self) -> &'p Program {
        self.program
    }

    pub fn portal(&self) -> Option<GraphId> {
        self.program.portal.map(|p| p.graph)
    }

    /// Collect the candidate graphs reachable from the portal.
    pub fn find_all_graphs(&mut self, policy: &dyn JitPolicy) {
        let Some(portal) = self.portal() else {
            return;
        };
        let mut todo = VecDeque::from([portal]);
        self.candidate_graphs.insert(portal);
        while let Some(id) = todo.pop_front() {
            let Some(graph) = self.program.graph(id) else {
                continue;
            };
            for callee in direct_callees(graph) {
                if self.candidate_graphs.contains(&callee) {
                    continue;
                }
                let Some(target) = self.program.graph(callee) else {
                    continue;
                };
                if policy.look_inside_graph(target) {
                    log::trace!("{} looks inside {}", graph.name, target.name);
                    self.candidate_graphs.insert(callee);
                    todo.push_back(callee);
                } else {
                    log::debug!("residual call from {} to {}", graph.name, target.name);
                }
            }
        }
        log::info!("{} candidate graphs", self.candidate_graphs.len());
    }

    pub fn is_candidate(&self, graph: GraphId) -> bool {
        self.candidate_graphs.contains(&graph)
    }

    pub fn guess_call_kind(&self, callee: GraphId) -> CallKind {
        if Some(callee) == self.portal() {
            CallKind::Recursive
        } else if self.is_candidate(callee) {
            CallKind::Regular
        } else {
            CallKind::Residual
        }
    }

    /// Jitcode id of `graph`, queueing it on first request.
    pub fn get_jitcode(&mut self, graph: GraphId) -> JitCodeId {
        if let Some(&id) = self.jitcodes.get(&graph) {
            return id;
        }
        let id = JitCodeId(self.next_id);
        self.next_id += 1;
        self.jitcodes.insert(graph, id);
        self.pending.push_back((graph, id));
        id
    }

    pub fn pop_pending(&mut self) -> Option<(GraphId, JitCodeId)> {
        self.pending.pop_front()
    }

    pub fn num_jitcodes(&self) -> usize {
        self.next_id as usize
    }
}

fn direct_callees(graph: &FlowGraph) -> impl Iterator<Item = GraphId> + '_ {
    graph
        .blocks
        .iter()
        .flat_map(|b| b.operations.iter())
        .filter(|op| op.opname == "direct_call")
        .filter_map(|op| match op.args.first() {
            Some(FlowArg::Graph(g)) => Some(*g),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codewriter::flow::SpaceOp;
    use crate::core::Kind;

    fn caller(name: &str, callees: &[GraphId]) -> FlowGraph {
        let mut g = FlowGraph::new(name, Kind::Void);
        let start = g.add_block(vec![]);
        for callee in callees {
            g.push_op(start, SpaceOp::new("direct_call", vec![FlowArg::Graph(*callee)], None));
        }
        g
    }

    #[test]
    fn test_policy_limits_candidates() {
        let mut program = Program::new();
        // Ids are assigned in insertion order: leaf=0, opaque=1, helper=2, portal=3.
        let leaf = program.add_graph(caller("leaf", &[]));
        let opaque = program.add_graph(caller("opaque", &[leaf]));
        let helper = program.add_graph(caller("helper", &[leaf, GraphId(3)]));
        let portal = program.add_graph(caller("portal", &[helper, opaque]));
        program.set_portal(portal, 1);

        let policy = OpaquePolicy {
            opaque: HashSet::from(["opaque".to_string()]),
        };
        let mut cc = CallControl::new(&program);
        cc.find_all_graphs(&policy);

        assert!(cc.is_candidate(leaf));
        assert!(!cc.is_candidate(opaque));
        assert_eq!(cc.guess_call_kind(helper), CallKind::Regular);
        assert_eq!(cc.guess_call_kind(opaque), CallKind::Residual);
        assert_eq!(cc.guess_call_kind(portal), CallKind::Recursive);
    }

    #[test]
    fn test_jitcode_ids_are_memoized_and_queued() {
        let mut program = Program::new();
        let a = program.add_graph(caller("a", &[]));
        let b = program.add_graph(caller("b", &[]));
        let mut cc = CallControl::new(&program);
        assert_eq!(cc.get_jitcode(b), JitCodeId(0));
        assert_eq!(cc.get_jitcode(a), JitCodeId(1));
        assert_eq!(cc.get_jitcode(b), JitCodeId(0));
        assert_eq!(cc.pop_pending(), Some((b, JitCodeId(0))));
        assert_eq!(cc.pop_pending(), Some((a, JitCodeId(1))));
        assert_eq!(cc.pop_pending(), None);
        assert_eq!(cc.num_jitcodes(), 2);
    }
}
