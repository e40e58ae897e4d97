// This module is the codewriter: it turns the flow graphs of the interpreter into jitcodes,
// the compact register-addressed bytecode the tracer and the blackhole interpreter execute.
// CodeWriter drives the per-graph pipeline (lowering, per-kind register allocation,
// liveness, flattening, assembly) and make_jitcodes walks every graph reachable from the
// portal through CallControl, so each callee is processed once no matter how many call
// sites reach it. All jitcodes of one run share the Assembler and therefore one opcode
// numbering and one descriptor list. Listings can be printed or dumped per graph for
// inspection, the portal always under the name "00_portal_runner".

//! Flow graph to jitcode pipeline.
//!
//! # Stages
//!
//! - [`jtransform`] - structural lowering and call classification
//! - [`regalloc`] - per-kind register allocation
//! - [`liveness`] - filling of `-live-` markers
//! - [`flatten`] - linear listings with labels and jumps
//! - [`assembler`] - byte encoding, constant pools and liveness tables
//!
//! [`format`] renders and parses listings; [`jitcode`] decodes the result.

pub mod assembler;
pub mod call;
pub mod descr;
pub mod flatten;
pub mod flow;
pub mod format;
pub mod jitcode;
pub mod jtransform;
pub mod liveness;
pub mod regalloc;

pub use assembler::Assembler;
pub use call::{CallControl, CallKind, DefaultPolicy, JitPolicy, OpaquePolicy};
pub use descr::{CallDescr, Descr, FieldDescr, JitCodeId, SwitchDescr};
pub use flatten::{Insn, SsaRepr};
pub use flow::{FlowGraph, GraphId, Program};
pub use format::{format_assembler, parse_assembler};
pub use jitcode::{InsnTable, JitCode};

use crate::core::{CompilationSession, CompileError, CompileResult};
use std::path::PathBuf;

/// Name under which the portal's listing is dumped.
pub const PORTAL_DUMP_NAME: &str = "00_portal_runner";

/// Every jitcode of one run, indexed by [`JitCodeId`].
#[derive(Debug, Default)]
pub struct JitCodeSet {
    pub jitcodes: Vec<JitCode>,
    pub main: JitCodeId,
}

impl JitCodeSet {
    pub fn get(&self, id: JitCodeId) -> Option<&JitCode> {
        self.jitcodes.get(id.0 as usize)
    }

    pub fn main(&self) -> Option<&JitCode> {
        self.get(self.main)
    }
}

pub struct CodeWriter<'s, 'arena> {
    assembler: Assembler<'s, 'arena>,
    /// Directory receiving one listing per graph, when not verbose.
    dump_dir: Option<PathBuf>,
    verbose: bool,
    switch_ids: u32,
}

impl<'s, 'arena> CodeWriter<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self {
            assembler: Assembler::new(session),
            dump_dir: None,
            verbose: false,
            switch_ids: 0,
        }
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn assembler(&self) -> &Assembler<'s, 'arena> {
        &self.assembler
    }

    /// Run the whole pipeline on one graph.
    pub fn transform_graph_to_jitcode(
        &mut self,
        graph: &flow::FlowGraph,
        callcontrol: &mut CallControl<'_>,
        portal_greens: Option<usize>,
    ) -> CompileResult<JitCode> {
        let mut lowered = jtransform::transform_graph(graph, callcontrol, portal_greens)?;
        let regs = regalloc::perform_register_allocation(&lowered)?;
        liveness::compute_liveness(&mut lowered);
        let ssarepr = flatten::flatten_graph(&lowered, &regs, &mut self.switch_ids)?;
        self.print_ssa_repr(&ssarepr, portal_greens.is_some());
        self.assembler.assemble(&ssarepr)
    }

    /// Produce the jitcodes of every graph reachable from the portal.
    pub fn make_jitcodes(&mut self, program: &Program, policy: &dyn JitPolicy) -> CompileResult<JitCodeSet> {
        let portal = program.portal.ok_or_else(|| CompileError::InvalidGraph {
            graph: "<program>".into(),
            reason: "no portal graph".into(),
        })?;
        let mut callcontrol = CallControl::new(program);
        callcontrol.find_all_graphs(policy);
        let main = callcontrol.get_jitcode(portal.graph);

        let mut jitcodes = Vec::new();
        while let Some((graph_id, jitcode_id)) = callcontrol.pop_pending() {
            let graph = program.graph(graph_id).ok_or_else(|| CompileError::InvalidGraph {
                graph: format!("#{}", graph_id.0),
                reason: "graph not in program".into(),
            })?;
            let portal_greens = (graph_id == portal.graph).then_some(portal.num_greens);
            log::debug!("jitcode {} for {}", jitcode_id.0, graph.name);
            let jitcode = self.transform_graph_to_jitcode(graph, &mut callcontrol, portal_greens)?;
            debug_assert_eq!(jitcodes.len(), jitcode_id.0 as usize);
            jitcodes.push(jitcode);
        }
        log::info!(
            "made {} jitcodes using {} opcodes",
            jitcodes.len(),
            self.assembler.insns().len()
        );
        Ok(JitCodeSet { jitcodes, main })
    }

    fn print_ssa_repr(&self, ssarepr: &SsaRepr, portal: bool) {
        if self.verbose {
            log::info!("{}:\n{}", ssarepr.name, indent(&format_assembler(ssarepr), 4));
            return;
        }
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let name = if portal {
            PORTAL_DUMP_NAME.to_string()
        } else if !ssarepr.name.is_empty() && ssarepr.name != "?" {
            ssarepr.name.clone()
        } else {
            format!("unnamed_{:x}", ssarepr as *const SsaRepr as usize)
        };
        let path = dir.join(name);
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, format_assembler(ssarepr))) {
            log::warn!("cannot dump {}: {}", path.display(), e);
        }
    }
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines().map(|l| format!("{}{}\n", pad, l)).collect()
}
