//! Ambient as-of state for one logical execution.
//!
//! The registry is a stack of frames over a base state. Entering a scoped
//! block pushes a frame derived from the current one and hands back a
//! [`ScopeGuard`] that mutably borrows the registry; nested scopes are entered
//! through the guard, so guards can only be dropped innermost first. Dropping
//! a guard pops its frame on normal exit, on `?` early returns, on panic
//! unwinding and when an enclosing future is dropped.
//!
//! Concurrent work never shares a registry: [`ScopeRegistry::fork`] hands each
//! execution its own copy starting from the current frame.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use aideon_tempo_core::{AsOf, Clock, Dimension, SystemClock, TimeCoords, Timestamp};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeState {
    /// Default filtering for queries made outside any association context.
    pub global: TimeCoords,
    /// Overrides every dimension at once; per-dimension `global` entries win over it.
    pub universal: Option<Timestamp>,
    /// Instants used when an association query is resolved.
    pub association: TimeCoords,
    /// Tags stamped onto records produced by association traversal.
    pub association_tags: TimeCoords,
}

impl ScopeState {
    pub fn global_constraint_for(&self, dimension: &Dimension) -> Option<Timestamp> {
        self.global.get(dimension).or(self.universal)
    }

    /// A bare instant becomes the universal instant and clears per-dimension
    /// global constraints; a map merges over them.
    pub fn apply_global(&mut self, as_of: AsOf) {
        match as_of {
            AsOf::At(at) => {
                self.global = TimeCoords::new();
                self.universal = Some(at);
            }
            AsOf::Coords(coords) => self.global.merge(&coords),
        }
    }

    /// Association constraint and tag together.
    pub fn apply_as_of(&mut self, coords: &TimeCoords) {
        self.association.merge(coords);
        self.association_tags.merge(coords);
    }
}

pub struct ScopeRegistry {
    base: ScopeState,
    frames: Vec<ScopeState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("depth", &self.depth())
            .field("state", self.current())
            .finish()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ScopeRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            base: ScopeState::default(),
            frames: Vec::new(),
            clock,
        }
    }

    /// An independent registry whose base is this registry's current frame.
    pub fn fork(&self) -> Self {
        Self {
            base: self.current().clone(),
            frames: Vec::new(),
            clock: self.clock.clone(),
        }
    }

    fn current(&self) -> &ScopeState {
        self.frames.last().unwrap_or(&self.base)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn snapshot(&self) -> ScopeState {
        self.current().clone()
    }

    /// Frames pushed on top of the base state.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn enter(&mut self, apply: impl FnOnce(&mut ScopeState)) -> usize {
        let depth = self.frames.len();
        let mut next = self.current().clone();
        apply(&mut next);
        log::debug!("tempo: enter scope depth={} state={next:?}", depth + 1);
        self.frames.push(next);
        depth
    }

    pub(crate) fn leave(&mut self, depth: usize) {
        self.frames.truncate(depth);
        log::debug!("tempo: leave scope depth={depth}");
    }

    fn push(&mut self, apply: impl FnOnce(&mut ScopeState)) -> ScopeGuard<'_> {
        let depth = self.enter(apply);
        ScopeGuard {
            registry: self,
            depth,
        }
    }

    pub fn with_global_constraint(&mut self, as_of: impl Into<AsOf>) -> ScopeGuard<'_> {
        let as_of = as_of.into();
        self.push(|state| state.apply_global(as_of))
    }

    pub fn with_association_constraint(&mut self, coords: &TimeCoords) -> ScopeGuard<'_> {
        self.push(|state| state.association.merge(coords))
    }

    pub fn with_association_tag(&mut self, coords: &TimeCoords) -> ScopeGuard<'_> {
        self.push(|state| state.association_tags.merge(coords))
    }

    /// Association constraint and tag together, as one frame.
    pub fn with_as_of(&mut self, coords: &TimeCoords) -> ScopeGuard<'_> {
        self.push(|state| state.apply_as_of(coords))
    }

    pub fn global_constraint_for(&self, dimension: &Dimension) -> Option<Timestamp> {
        self.current().global_constraint_for(dimension)
    }

    pub fn global_constraints_for(&self, dimensions: &[Dimension]) -> TimeCoords {
        let state = self.current();
        dimensions
            .iter()
            .filter_map(|dimension| {
                state
                    .global_constraint_for(dimension)
                    .map(|at| (dimension.clone(), at))
            })
            .collect()
    }

    /// Never absent: falls back to the global constraint, then to the clock.
    pub fn association_constraint_for(&self, dimension: &Dimension) -> Timestamp {
        let state = self.current();
        state
            .association
            .get(dimension)
            .or_else(|| state.global_constraint_for(dimension))
            .unwrap_or_else(|| self.clock.now())
    }

    pub fn association_constraints_for(&self, dimensions: &[Dimension]) -> TimeCoords {
        let state = self.current();
        let mut now = None;
        dimensions
            .iter()
            .map(|dimension| {
                let at = state
                    .association
                    .get(dimension)
                    .or_else(|| state.global_constraint_for(dimension))
                    .unwrap_or_else(|| *now.get_or_insert_with(|| self.clock.now()));
                (dimension.clone(), at)
            })
            .collect()
    }

    pub fn association_tag_for(&self, dimension: &Dimension) -> Option<Timestamp> {
        self.current().association_tags.get(dimension)
    }

    pub fn association_tags_for(&self, dimensions: &[Dimension]) -> TimeCoords {
        self.current().association_tags.restrict(dimensions)
    }
}

/// Pops the frame it pushed when dropped. Nested scopes are entered through
/// the guard, which keeps the stack strictly last-in-first-out.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ScopeGuard<'a> {
    registry: &'a mut ScopeRegistry,
    depth: usize,
}

impl Deref for ScopeGuard<'_> {
    type Target = ScopeRegistry;

    fn deref(&self) -> &ScopeRegistry {
        &*self.registry
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScopeRegistry {
        &mut *self.registry
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.registry.leave(self.depth);
    }
}
