//! Whole-program runs of the codewriter.

mod common;

use bumpalo::Bump;
use common::init_logging;
use tracejit::codewriter::flow::{Exit, FlowArg, SpaceOp};
use tracejit::codewriter::{CodeWriter, DefaultPolicy, FlowGraph, GraphId, JitCodeId, OpaquePolicy, Program};
use tracejit::core::{CompilationSession, CompileError, Const, Kind};

/// `add_one(x) = x + 1`
fn add_one() -> FlowGraph {
    let mut g = FlowGraph::new("add_one", Kind::Int);
    let x = g.new_var(Kind::Int);
    let start = g.add_block(vec![x]);
    let r = g.new_var(Kind::Int);
    g.push_op(start, SpaceOp::new("int_add", vec![x.into(), Const::Int(1).into()], Some(r)));
    g.set_exit(start, Exit::Return(Some(r.into())));
    g
}

/// Portal with one green (`pc`) and one red (`acc`) calling `callee` on `acc`.
fn portal(callee: GraphId) -> FlowGraph {
    let mut g = FlowGraph::new("portal", Kind::Int);
    let pc = g.new_var(Kind::Int);
    let acc = g.new_var(Kind::Int);
    let start = g.add_block(vec![pc, acc]);
    let r = g.new_var(Kind::Int);
    g.push_op(start, SpaceOp::new("jit_merge_point", vec![pc.into(), acc.into()], None));
    g.push_op(
        start,
        SpaceOp::new("direct_call", vec![FlowArg::Graph(callee), acc.into()], Some(r)),
    );
    g.push_op(start, SpaceOp::new("can_enter_jit", vec![pc.into(), r.into()], None));
    g.set_exit(start, Exit::Return(Some(r.into())));
    g
}

fn program() -> Program {
    let mut program = Program::new();
    let helper = program.add_graph(add_one());
    let main = program.add_graph(portal(helper));
    program.set_portal(main, 1);
    program
}

fn opnames(writer: &CodeWriter<'_, '_>, code: &tracejit::JitCode) -> Vec<String> {
    code.decode(writer.assembler().insns())
        .unwrap()
        .into_iter()
        .map(|insn| insn.opname)
        .collect()
}

#[test]
fn test_portal_and_callee_get_jitcodes() {
    init_logging();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut writer = CodeWriter::new(&session);
    let set = writer.make_jitcodes(&program(), &DefaultPolicy).unwrap();

    assert_eq!(set.jitcodes.len(), 2);
    assert_eq!(set.main, JitCodeId(0));
    let main = set.main().unwrap();
    assert_eq!(main.name, "portal");
    assert_eq!(set.get(JitCodeId(1)).unwrap().name, "add_one");

    let names = opnames(&writer, main);
    assert!(names.iter().any(|n| n == "jit_merge_point"));
    assert!(names.iter().any(|n| n == "inline_call_ir_i"));
    assert!(names.iter().any(|n| n == "loop_header"));
    assert_eq!(names.last().map(String::as_str), Some("int_return"));
    assert!(!main.liveness.is_empty());

    let stats = session.stats();
    assert_eq!(stats.jitcodes_assembled, 2);
}

#[test]
fn test_opaque_callee_becomes_residual() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut writer = CodeWriter::new(&session);
    let policy = OpaquePolicy {
        opaque: ["add_one".to_string()].into_iter().collect(),
    };
    let set = writer.make_jitcodes(&program(), &policy).unwrap();

    assert_eq!(set.jitcodes.len(), 1);
    let names = opnames(&writer, set.main().unwrap());
    assert!(names.iter().any(|n| n == "residual_call_ir_i"));
    assert!(!names.iter().any(|n| n.starts_with("inline_call")));
}

#[test]
fn test_calls_back_into_the_portal_are_recursive() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut writer = CodeWriter::new(&session);
    let mut program = Program::new();
    // The portal calls itself: it is graph 0.
    let main = program.add_graph(portal(GraphId(0)));
    program.set_portal(main, 1);

    let set = writer.make_jitcodes(&program, &DefaultPolicy).unwrap();
    assert_eq!(set.jitcodes.len(), 1);
    let names = opnames(&writer, set.main().unwrap());
    assert!(names.iter().any(|n| n == "recursive_call_i"));
}

#[test]
fn test_program_without_portal_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut writer = CodeWriter::new(&session);
    let mut program = Program::new();
    program.add_graph(add_one());
    assert!(matches!(
        writer.make_jitcodes(&program, &DefaultPolicy),
        Err(CompileError::InvalidGraph { .. })
    ));
}

#[test]
fn test_listings_are_dumped_per_graph() {
    let dir = std::env::temp_dir().join(format!("tracejit-dump-{}", std::process::id()));
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut writer = CodeWriter::new(&session).with_dump_dir(&dir);
    writer.make_jitcodes(&program(), &DefaultPolicy).unwrap();

    let portal_listing = std::fs::read_to_string(dir.join("00_portal_runner")).unwrap();
    assert!(portal_listing.contains("jit_merge_point"));
    assert!(dir.join("add_one").exists());
    let _ = std::fs::remove_dir_all(&dir);
}
