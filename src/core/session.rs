// This module provides arena-based compilation session management using the bumpalo crate.
// A CompilationSession spans one codewriter run: it owns a reference to the arena, interns
// the instruction-shape keys ("mnemonic/argcodes") that the assembler maps to numeric
// opcodes so every jitcode of the unit shares the same &'arena str, and accumulates
// SessionStats. The statistics record how many jitcodes were assembled, their total byte
// size, an instruction breakdown by shape, how many constants went to a pool versus being
// inlined as short integers, liveness table entries, and the largest jitcode seen. Interior
// mutability (RefCell) keeps the session shareable by reference between pipeline stages.

//! Arena-based compilation session management.
//!
//! All objects handed out by the session live as long as its arena, so
//! instruction tables can hold plain `&'arena str` keys.

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for instruction shapes and names.
    interned_strings: RefCell<HashSet<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashSet::new()),
        }
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    /// Record that a jitcode was assembled.
    pub fn record_jitcode_assembled(&self, name: &str, code_size: usize, liveness_entries: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.jitcodes_assembled += 1;
        stats.total_code_size += code_size;
        stats.liveness_entries += liveness_entries;

        if stats.largest_jitcode_size < code_size || stats.largest_jitcode_name.is_empty() {
            stats.largest_jitcode_size = code_size;
            stats.largest_jitcode_name = name.to_string();
        }
    }

    /// Record one encoded instruction by its shape key.
    pub fn record_instruction_assembled(&self, key: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_assembled += 1;
        *stats
            .instruction_counts
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    /// Record a constant stored in a pool.
    pub fn record_constant_pooled(&self) {
        self.stats.borrow_mut().constants_pooled += 1;
    }

    /// Record a constant encoded inline as a short integer.
    pub fn record_constant_inlined(&self) {
        self.stats.borrow_mut().constants_inlined += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of jitcodes assembled.
    pub jitcodes_assembled: usize,

    /// Total bytes of code emitted.
    pub total_code_size: usize,

    /// Number of instructions encoded.
    pub instructions_assembled: usize,

    /// Count of each instruction shape encoded.
    pub instruction_counts: HashMap<String, usize>,

    /// Constants that took a pool slot.
    pub constants_pooled: usize,

    /// Constants encoded inline.
    pub constants_inlined: usize,

    /// Entries across all liveness tables.
    pub liveness_entries: usize,

    /// Largest jitcode assembled (bytes).
    pub largest_jitcode_size: usize,

    /// Name of largest jitcode.
    pub largest_jitcode_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Jitcodes assembled: {}", self.jitcodes_assembled)?;
        writeln!(f, "  Instructions assembled: {}", self.instructions_assembled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(
            f,
            "  Constants: {} pooled, {} inlined",
            self.constants_pooled, self.constants_inlined
        )?;
        writeln!(f, "  Liveness entries: {}", self.liveness_entries)?;

        if !self.largest_jitcode_name.is_empty() {
            writeln!(
                f,
                "  Largest jitcode: {} ({} bytes)",
                self.largest_jitcode_name, self.largest_jitcode_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (key, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", key, count)?;
            }
        }

        Ok(())
    }
}
