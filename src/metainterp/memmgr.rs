//! Memory manager for compiled procedures.
//!
//! Each use of a token stamps it with the current generation. When a new
//! generation starts, tokens last used more than `max_age` generations
//! before the previous one are retired, as are invalidated tokens, unless
//! a live token may still jump to them. A `max_age` of zero disables
//! eviction.

use super::backend::Backend;
use super::history::{ProcedureTokenId, TokenRegistry};
use hashbrown::HashSet;

#[derive(Debug)]
pub struct MemoryManager {
    max_age: u64,
    current_generation: u64,
    alive: HashSet<ProcedureTokenId>,
}

impl MemoryManager {
    pub fn new(max_age: u64) -> Self {
        Self {
            max_age,
            current_generation: 1,
            alive: HashSet::new(),
        }
    }

    pub fn set_max_age(&mut self, max_age: u64) {
        self.max_age = max_age;
    }

    pub fn current_generation(&self) -> u64 {
        self.current_generation
    }

    pub fn keep_loop_alive(&mut self, registry: &mut TokenRegistry, token: ProcedureTokenId) {
        if let Some(t) = registry.token_mut(token) {
            if t.generation != self.current_generation {
                t.generation = self.current_generation;
                self.alive.insert(token);
            }
        }
    }

    /// Start a new generation and retire the tokens that aged out.
    pub fn next_generation(&mut self, registry: &mut TokenRegistry, backend: &mut dyn Backend) -> Vec<ProcedureTokenId> {
        self.current_generation += 1;
        if self.max_age == 0 {
            return Vec::new();
        }
        let Some(max_generation) = self.current_generation.checked_sub(self.max_age + 1) else {
            return Vec::new();
        };

        let (young, old): (Vec<_>, Vec<_>) = self.alive.iter().copied().partition(|id| {
            registry
                .token(*id)
                .is_some_and(|t| t.generation >= max_generation && !t.invalidated)
        });

        // Everything reachable from a young token through jump edges stays.
        let mut reachable: HashSet<ProcedureTokenId> = young.iter().copied().collect();
        let mut todo = young;
        while let Some(id) = todo.pop() {
            if let Some(token) = registry.token(id) {
                for next in &token.jumps_to {
                    if reachable.insert(*next) {
                        todo.push(*next);
                    }
                }
            }
        }

        let mut freed: Vec<ProcedureTokenId> = old.into_iter().filter(|id| !reachable.contains(id)).collect();
        freed.sort();
        for id in &freed {
            self.alive.remove(id);
            registry.retire(*id);
            backend.free_loop(*id);
        }
        if !freed.is_empty() {
            log::info!(
                "generation {}: freed {} loops, {} alive",
                self.current_generation,
                freed.len(),
                self.alive.len()
            );
        }
        freed
    }

    pub fn alive_count(&self) -> usize {
        self.alive.len()
    }
}
