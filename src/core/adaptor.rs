// This module defines the IrAdaptor trait, the bridge between the analysis passes of the
// codewriter and the flow graphs they run on. It exposes the minimal structure the
// Analyzer and the register allocator need: graphs, blocks in a graph, the arguments a
// block receives over its incoming links, the operations of a block and their operands and
// results, successor blocks, and the values read by a block's exit (branch condition and
// link arguments). Values passed between blocks travel only as link arguments, so a block
// argument is the definition point of a value in its block.

//! Adaptor over control-flow graphs.
//!
//! The framework assumes:
//! - Each graph has a single entry block.
//! - A block receives values through its arguments, runs a list of
//!   operations, and ends in an exit that may read values and pass them to
//!   successor blocks.
//! - Operations produce at most one result.

use core::hash::Hash;

/// Bridge between a flow-graph IR and the analysis passes.
pub trait IrAdaptor {
    type ValueRef: Copy + Eq + Hash;
    type InstRef: Copy + Eq;
    type BlockRef: Copy + Eq + Hash;
    type FuncRef: Copy + Eq;

    /// Number of graphs available.
    fn func_count(&self) -> u32;

    /// Iterator over all graphs.
    fn funcs(&self) -> Box<dyn Iterator<Item = Self::FuncRef> + '_>;

    /// Name of the graph, for diagnostics.
    fn func_link_name(&self, func: Self::FuncRef) -> &str;

    /// Switch to the given graph before analysing it.
    fn switch_func(&mut self, func: Self::FuncRef) -> bool;

    /// Entry block of the current graph.
    fn entry_block(&self) -> Self::BlockRef;

    /// Iterator over blocks in the current graph.
    fn blocks(&self) -> Box<dyn Iterator<Item = Self::BlockRef> + '_>;

    /// Values a block receives from its incoming links.
    fn block_args(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_>;

    /// Iterator over operations of the given block.
    fn block_insts(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::InstRef> + '_>;

    /// Successor blocks of a given block.
    fn block_succs(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::BlockRef> + '_>;

    /// Values read by the block's exit: condition and outgoing link arguments.
    fn block_exit_uses(&self, block: Self::BlockRef)
        -> Box<dyn Iterator<Item = Self::ValueRef> + '_>;

    /// Iterator over the operands of an operation.
    fn inst_operands(&self, inst: Self::InstRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_>;

    /// Iterator over the result values produced by an operation.
    fn inst_results(&self, inst: Self::InstRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_>;

    /// Should this value be ignored during liveness analysis?
    fn val_ignore_liveness(&self, _val: Self::ValueRef) -> bool {
        false
    }
}
