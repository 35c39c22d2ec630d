//! Per-call-site tracing state
//!
//! Every control point in the host interpreter is identified by a [`Location`].
//! A Location moves through the following states:
//!
//! ```text
//! Fresh ──► Counting ──► Tracing ──► Compiling ──► Compiled
//!    │          ▲           │             │
//!    └──────────┼──► ───────┘             └──► FailedCompile
//!               └── abort ◄─┘
//! ```
//!
//! All transitions go through [`LocationTag::step`], which is exhaustive: a
//! transition not listed there is an internal invariant violation. State lives
//! in atomics so that many interpreter threads can visit the same Location; the
//! compiled artifact is written once through a `OnceLock`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::trace;

use crate::jit::CompiledTrace;

/// Identifier of a Location, unique for the lifetime of its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(u64);

impl LocationId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        LocationId(raw)
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.0)
    }
}

/// State discriminant, stored in a single `AtomicU8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LocationTag {
    /// Never visited.
    Fresh = 0,
    /// Visited, hot counter below the threshold.
    Counting = 1,
    /// A thread is recording a trace starting here.
    Tracing = 2,
    /// The trace is with the compiler.
    Compiling = 3,
    /// A compiled artifact is installed.
    Compiled = 4,
    /// The compiler rejected the trace; never traced again.
    FailedCompile = 5,
}

impl LocationTag {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LocationTag::Fresh,
            1 => LocationTag::Counting,
            2 => LocationTag::Tracing,
            3 => LocationTag::Compiling,
            4 => LocationTag::Compiled,
            5 => LocationTag::FailedCompile,
            _ => crate::fatal(format_args!("corrupt location state tag {}", v)),
        }
    }

    /// The state machine. Anything not listed is rejected.
    ///
    /// `FailedCompile` has no outgoing transitions; a retry policy would be
    /// added here.
    pub fn step(self, transition: Transition) -> Result<LocationTag, InvalidTransition> {
        use LocationTag::*;
        use Transition::*;
        match (self, transition) {
            (Fresh | Counting, Count) => Ok(Counting),
            (Fresh | Counting, StartTracing) => Ok(Tracing),
            (Tracing, AbortTracing) => Ok(Counting),
            (Tracing, StopTracing) => Ok(Compiling),
            (Compiling, CompileSucceeded) => Ok(Compiled),
            (Compiling, CompileFailed) => Ok(FailedCompile),
            (
                Fresh | Counting | Tracing | Compiling | Compiled | FailedCompile,
                Count | StartTracing | AbortTracing | StopTracing | CompileSucceeded
                | CompileFailed,
            ) => Err(InvalidTransition {
                from: self,
                transition,
            }),
        }
    }
}

/// Events that move a Location between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Count,
    StartTracing,
    AbortTracing,
    StopTracing,
    CompileSucceeded,
    CompileFailed,
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: LocationTag,
    pub transition: Transition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {:?} from {:?}", self.transition, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Snapshot of a Location's state.
#[derive(Clone)]
pub enum LocationState {
    Fresh,
    Counting(u32),
    Tracing,
    Compiling,
    Compiled(Arc<CompiledTrace>),
    FailedCompile,
}

impl LocationState {
    pub fn tag(&self) -> LocationTag {
        match self {
            LocationState::Fresh => LocationTag::Fresh,
            LocationState::Counting(_) => LocationTag::Counting,
            LocationState::Tracing => LocationTag::Tracing,
            LocationState::Compiling => LocationTag::Compiling,
            LocationState::Compiled(_) => LocationTag::Compiled,
            LocationState::FailedCompile => LocationTag::FailedCompile,
        }
    }
}

impl fmt::Debug for LocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationState::Fresh => write!(f, "Fresh"),
            LocationState::Counting(n) => write!(f, "Counting({})", n),
            LocationState::Tracing => write!(f, "Tracing"),
            LocationState::Compiling => write!(f, "Compiling"),
            LocationState::Compiled(ct) => write!(f, "Compiled({})", ct.name()),
            LocationState::FailedCompile => write!(f, "FailedCompile"),
        }
    }
}

/// Shared per-Location state.
///
/// Held by the registry (so compile jobs can find it by id) and by the owning
/// [`Location`] handle.
#[derive(Debug)]
pub(crate) struct LocationCell {
    id: LocationId,
    tag: AtomicU8,
    count: AtomicU32,
    compiled: OnceLock<Arc<CompiledTrace>>,
}

impl LocationCell {
    fn new(id: LocationId) -> Self {
        LocationCell {
            id,
            tag: AtomicU8::new(LocationTag::Fresh as u8),
            count: AtomicU32::new(0),
            compiled: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> LocationId {
        self.id
    }

    #[inline]
    pub(crate) fn tag(&self) -> LocationTag {
        LocationTag::from_u8(self.tag.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Apply `transition` if the current state allows it.
    ///
    /// Returns `Ok(false)` when another thread changed the state first and the
    /// new state no longer accepts the transition, `Err` when the transition is
    /// illegal from a state that nobody else could have changed.
    pub(crate) fn try_step(&self, transition: Transition) -> Result<bool, InvalidTransition> {
        let mut current = self.tag.load(Ordering::Acquire);
        loop {
            let from = LocationTag::from_u8(current);
            let to = match from.step(transition) {
                Ok(to) => to,
                Err(e) if Self::raceable(transition) => {
                    trace!(location = %self.id, error = %e, "lost location state race");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            match self.tag.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }

    /// Counting and starting a trace race with other visitors; every other
    /// transition is only ever made by the thread that owns the current state.
    fn raceable(transition: Transition) -> bool {
        matches!(transition, Transition::Count | Transition::StartTracing)
    }

    /// Bump the hot counter, saturating at `u32::MAX`.
    pub(crate) fn bump(&self) -> Result<(), InvalidTransition> {
        if self.tag() == LocationTag::Fresh {
            self.try_step(Transition::Count)?;
        }
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1));
        Ok(())
    }

    pub(crate) fn reset_count(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    /// Install the compiled artifact, then publish `Compiled`.
    pub(crate) fn install(&self, ct: Arc<CompiledTrace>) -> Result<(), InvalidTransition> {
        if self.compiled.set(ct).is_err() {
            crate::fatal(format_args!("{} already has a compiled trace", self.id));
        }
        self.try_step(Transition::CompileSucceeded).map(|_| ())
    }

    pub(crate) fn compiled(&self) -> Option<&Arc<CompiledTrace>> {
        self.compiled.get()
    }

    pub(crate) fn snapshot(&self) -> LocationState {
        match self.tag() {
            LocationTag::Fresh => LocationState::Fresh,
            LocationTag::Counting => LocationState::Counting(self.count()),
            LocationTag::Tracing => LocationState::Tracing,
            LocationTag::Compiling => LocationState::Compiling,
            LocationTag::Compiled => match self.compiled.get() {
                Some(ct) => LocationState::Compiled(Arc::clone(ct)),
                None => crate::fatal(format_args!("{} compiled without an artifact", self.id)),
            },
            LocationTag::FailedCompile => LocationState::FailedCompile,
        }
    }
}

/// Allocates Location ids and maps them to their shared state.
#[derive(Debug)]
pub(crate) struct LocationRegistry {
    next_id: AtomicU64,
    live: DashMap<LocationId, Arc<LocationCell>>,
}

impl LocationRegistry {
    pub(crate) fn new() -> Self {
        LocationRegistry {
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
        }
    }

    fn register(&self) -> Arc<LocationCell> {
        let id = LocationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(LocationCell::new(id));
        self.live.insert(id, Arc::clone(&cell));
        cell
    }

    pub(crate) fn get(&self, id: LocationId) -> Option<Arc<LocationCell>> {
        self.live.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, id: LocationId) {
        self.live.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

/// A control point's tracing state.
///
/// Created by [`crate::MT::location_new`]; dropping it retires the id and any
/// compiled trace it owns. Share it between interpreter threads by reference.
pub struct Location {
    cell: Arc<LocationCell>,
    registry: Arc<LocationRegistry>,
}

impl Location {
    pub(crate) fn new(registry: &Arc<LocationRegistry>) -> Self {
        let cell = registry.register();
        trace!(location = %cell.id(), "location created");
        Location {
            cell,
            registry: Arc::clone(registry),
        }
    }

    pub fn id(&self) -> LocationId {
        self.cell.id()
    }

    pub fn state(&self) -> LocationState {
        self.cell.snapshot()
    }

    pub(crate) fn cell(&self) -> &Arc<LocationCell> {
        &self.cell
    }

    pub(crate) fn registered_with(&self, registry: &Arc<LocationRegistry>) -> bool {
        Arc::ptr_eq(&self.registry, registry)
    }
}

impl Drop for Location {
    fn drop(&mut self) {
        trace!(location = %self.cell.id(), "location dropped");
        self.registry.remove(self.cell.id());
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL_TAGS: [LocationTag; 6] = [
        LocationTag::Fresh,
        LocationTag::Counting,
        LocationTag::Tracing,
        LocationTag::Compiling,
        LocationTag::Compiled,
        LocationTag::FailedCompile,
    ];

    const ALL_TRANSITIONS: [Transition; 6] = [
        Transition::Count,
        Transition::StartTracing,
        Transition::AbortTracing,
        Transition::StopTracing,
        Transition::CompileSucceeded,
        Transition::CompileFailed,
    ];

    #[test]
    fn test_legal_transitions() {
        assert_eq!(
            LocationTag::Fresh.step(Transition::Count),
            Ok(LocationTag::Counting)
        );
        assert_eq!(
            LocationTag::Counting.step(Transition::StartTracing),
            Ok(LocationTag::Tracing)
        );
        assert_eq!(
            LocationTag::Tracing.step(Transition::AbortTracing),
            Ok(LocationTag::Counting)
        );
        assert_eq!(
            LocationTag::Tracing.step(Transition::StopTracing),
            Ok(LocationTag::Compiling)
        );
        assert_eq!(
            LocationTag::Compiling.step(Transition::CompileSucceeded),
            Ok(LocationTag::Compiled)
        );
        assert_eq!(
            LocationTag::Compiling.step(Transition::CompileFailed),
            Ok(LocationTag::FailedCompile)
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for t in ALL_TRANSITIONS {
            assert!(LocationTag::FailedCompile.step(t).is_err());
            assert!(LocationTag::Compiled.step(t).is_err());
        }
    }

    #[test]
    fn test_legal_edge_count() {
        let legal = ALL_TAGS
            .iter()
            .flat_map(|tag| ALL_TRANSITIONS.iter().map(move |t| tag.step(*t)))
            .filter(|r| r.is_ok())
            .count();
        // Fresh and Counting share Count and StartTracing.
        assert_eq!(legal, 8);
    }

    #[test]
    fn test_tag_round_trips_through_u8() {
        for tag in ALL_TAGS {
            assert_eq!(LocationTag::from_u8(tag as u8), tag);
        }
    }

    #[test]
    fn test_ids_are_unique_and_not_reused() {
        let registry = Arc::new(LocationRegistry::new());
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let loc = Location::new(&registry);
            assert!(seen.insert(loc.id()));
        }
        assert_eq!(registry.len(), 0);
        let loc = Location::new(&registry);
        assert!(!seen.contains(&loc.id()));
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = Arc::new(LocationRegistry::new());
        let loc = Location::new(&registry);
        let id = loc.id();
        assert!(registry.get(id).is_some());
        drop(loc);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_bump_moves_fresh_to_counting() {
        let registry = Arc::new(LocationRegistry::new());
        let loc = Location::new(&registry);
        assert!(matches!(loc.state(), LocationState::Fresh));
        loc.cell().bump().unwrap();
        loc.cell().bump().unwrap();
        assert!(matches!(loc.state(), LocationState::Counting(2)));
    }

    #[test]
    fn test_start_tracing_has_one_winner() {
        let registry = Arc::new(LocationRegistry::new());
        let loc = Location::new(&registry);
        let wins = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| loc.cell().try_step(Transition::StartTracing).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        assert_eq!(loc.state().tag(), LocationTag::Tracing);
    }

    #[test]
    fn test_owner_transition_from_wrong_state_is_an_error() {
        let registry = Arc::new(LocationRegistry::new());
        let loc = Location::new(&registry);
        assert!(loc.cell().try_step(Transition::StopTracing).is_err());
    }

    #[test]
    fn test_registered_with() {
        let a = Arc::new(LocationRegistry::new());
        let b = Arc::new(LocationRegistry::new());
        let loc = Location::new(&a);
        assert!(loc.registered_with(&a));
        assert!(!loc.registered_with(&b));
    }
}
