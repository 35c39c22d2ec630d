//! Meta-tracing coordinator
//!
//! The [`MT`] owns everything shared between interpreter threads: the hot
//! threshold, the Location registry, the tracing session, the trace compiler
//! and the diagnostic stream. Interpreter threads call
//! [`MT::control_point`] at every loop header and [`MT::record`] for every
//! operation they execute while [`MT::is_tracing`] holds.
//!
//! # Dispatch
//!
//! ```text
//! this thread is recording    -> same Location at depth 0: close the trace
//!                                same Location deeper:     abort the trace
//!                                other Location:           inlined, ignored
//! Fresh / Counting            -> count, or start tracing once hot
//! Tracing / Compiling         -> interpret
//! Compiled                    -> run the trace, deoptimise on guard failure
//! FailedCompile               -> interpret
//! ```
//!
//! The recording itself lives in a thread local, so only the thread that
//! started a trace ever feeds it.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::{IrStage, IrStages, MtConfig};
use crate::ctrlvars::{Continuation, ControlPointVars};
use crate::deopt;
use crate::diag::{DiagSink, Diagnostics, JitEvent};
use crate::exec::{self, ExecOutcome};
use crate::jit::{CompileError, CompiledTrace, CraneliftCompiler, TraceCompiler};
use crate::location::{Location, LocationCell, LocationId, LocationRegistry, LocationTag, Transition};
use crate::trace::{Trace, TraceAbort, TraceEvent, TraceRecorder};

static NEXT_MT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_TRACE: RefCell<Option<ActiveTrace>> = const { RefCell::new(None) };
}

/// Counters exposed through [`MT::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtStats {
    pub traces_started: u64,
    pub traces_compiled: u64,
    pub trace_aborts: u64,
    pub compile_failures: u64,
    pub jit_entries: u64,
    pub deopts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    traces_started: AtomicU64,
    traces_compiled: AtomicU64,
    trace_aborts: AtomicU64,
    compile_failures: AtomicU64,
    jit_entries: AtomicU64,
    deopts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MtStats {
        MtStats {
            traces_started: self.traces_started.load(Ordering::Relaxed),
            traces_compiled: self.traces_compiled.load(Ordering::Relaxed),
            trace_aborts: self.trace_aborts.load(Ordering::Relaxed),
            compile_failures: self.compile_failures.load(Ordering::Relaxed),
            jit_entries: self.jit_entries.load(Ordering::Relaxed),
            deopts: self.deopts.load(Ordering::Relaxed),
        }
    }
}

/// The coordinator's single tracing slot: the id of the Location being traced,
/// or 0.
#[derive(Debug, Default)]
struct TraceSession {
    active: AtomicU64,
    /// Set when the owning coordinator is dropped.
    closed: AtomicBool,
}

impl TraceSession {
    fn acquire(&self, loc: LocationId) -> bool {
        self.active
            .compare_exchange(0, loc.as_u64(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self, loc: LocationId) {
        let _ = self
            .active
            .compare_exchange(loc.as_u64(), 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Number of compile jobs in flight.
#[derive(Debug, Default)]
struct CompileTracker {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl CompileTracker {
    fn begin(&self) {
        *self.pending.lock() += 1;
    }

    fn end(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    fn in_flight(&self) -> usize {
        *self.pending.lock()
    }
}

/// Ends a job on drop, so a job that unwinds still counts as finished.
struct JobGuard(Arc<CompileTracker>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// A recording owned by the current thread.
struct ActiveTrace {
    mt_id: u64,
    cell: Arc<LocationCell>,
    session: Arc<TraceSession>,
    counters: Arc<Counters>,
    recorder: Option<TraceRecorder>,
}

impl ActiveTrace {
    fn record(&mut self, event: TraceEvent<'_>) -> Result<(), TraceAbort> {
        match self.recorder.as_mut() {
            Some(recorder) => recorder.record(event),
            None => Ok(()),
        }
    }

    /// Discard the recording and hand the Location back to counting.
    fn abort(mut self, reason: TraceAbort) {
        self.recorder = None;
        self.revert(&reason);
    }

    fn revert(&self, reason: &TraceAbort) {
        debug!(location = %self.cell.id(), reason = %reason, "trace aborted");
        self.cell.reset_count();
        if let Err(e) = self.cell.try_step(Transition::AbortTracing) {
            crate::fatal(format_args!("aborting trace at {}: {}", self.cell.id(), e));
        }
        self.session.release(self.cell.id());
        Counters::bump(&self.counters.trace_aborts);
    }
}

impl Drop for ActiveTrace {
    fn drop(&mut self) {
        if self.recorder.take().is_some() {
            self.revert(&TraceAbort::Abandoned);
        }
    }
}

/// How this thread's recording relates to a control-point visit.
enum Recording {
    None,
    /// Recording for a different coordinator.
    Foreign,
    /// Back at the traced Location.
    Closing(ActiveTrace),
    /// At some other Location inside the trace.
    Inlined,
}

/// A meta-tracing coordinator.
pub struct MT {
    id: u64,
    hot_threshold: AtomicU32,
    synchronous_compile: bool,
    max_trace_len: usize,
    diag: Arc<Diagnostics>,
    registry: Arc<LocationRegistry>,
    session: Arc<TraceSession>,
    compiler: Arc<dyn TraceCompiler>,
    jobs: Arc<CompileTracker>,
    counters: Arc<Counters>,
}

impl MT {
    /// A coordinator with the Cranelift backend and diagnostics on stderr.
    pub fn new(config: MtConfig) -> Self {
        MtBuilder::from_config(config).build()
    }

    pub fn builder() -> MtBuilder {
        MtBuilder::default()
    }

    pub fn hot_threshold(&self) -> u32 {
        self.hot_threshold.load(Ordering::Relaxed)
    }

    /// Takes effect for every Location on its next visit.
    pub fn set_hot_threshold(&self, threshold: u32) {
        self.hot_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn synchronous_compile(&self) -> bool {
        self.synchronous_compile
    }

    pub fn max_trace_len(&self) -> usize {
        self.max_trace_len
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    pub fn stats(&self) -> MtStats {
        self.counters.snapshot()
    }

    pub fn location_new(&self) -> Location {
        Location::new(&self.registry)
    }

    /// Number of live Locations created by this coordinator.
    pub fn location_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether the current thread is recording a trace for this coordinator.
    pub fn is_tracing(&self) -> bool {
        ACTIVE_TRACE.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|active| active.mt_id == self.id)
        })
    }

    /// Feed an executed operation to this thread's recording, if any.
    ///
    /// An operation the recorder cannot handle aborts the trace.
    pub fn record(&self, event: TraceEvent<'_>) {
        let failed = ACTIVE_TRACE.with(|slot| {
            let mut slot = slot.borrow_mut();
            let result = match slot.as_mut() {
                Some(active) if active.mt_id == self.id => active.record(event),
                _ => return None,
            };
            match result {
                Ok(()) => None,
                Err(reason) => slot.take().map(|active| (active, reason)),
            }
        });
        if let Some((active, reason)) = failed {
            active.abort(reason);
        }
    }

    /// Abandon this thread's recording, if it belongs to this coordinator.
    pub fn abort_tracing(&self) {
        let active = ACTIVE_TRACE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.as_ref() {
                Some(active) if active.mt_id == self.id => slot.take(),
                _ => None,
            }
        });
        if let Some(active) = active {
            active.abort(TraceAbort::Abandoned);
        }
    }

    /// Block until every background compile job has finished.
    pub fn wait_for_compilation(&self) {
        self.jobs.wait();
    }

    /// Number of compile jobs still running.
    pub fn compiles_in_flight(&self) -> usize {
        self.jobs.in_flight()
    }

    /// Visit the control point `loc` with the frame's live variables.
    ///
    /// On return, [`ControlPointVars::continuation`] tells the interpreter how
    /// to carry on.
    pub fn control_point(&self, loc: &Location, vars: &mut ControlPointVars<'_>) {
        vars.set_continuation(Continuation::Interpret);
        if !loc.registered_with(&self.registry) {
            crate::fatal(format_args!(
                "{} used with a meta-tracer that did not create it",
                loc.id()
            ));
        }

        match self.recording_at(loc) {
            Recording::None => {}
            Recording::Foreign | Recording::Inlined => return,
            Recording::Closing(active) => {
                self.close_trace(active);
                return;
            }
        }

        let cell = loc.cell();
        match cell.tag() {
            LocationTag::Fresh | LocationTag::Counting => {
                if cell.count() < self.hot_threshold() {
                    if let Err(e) = cell.bump() {
                        crate::fatal(format_args!("counting {}: {}", cell.id(), e));
                    }
                } else {
                    self.start_tracing(cell, vars);
                }
            }
            LocationTag::Tracing | LocationTag::Compiling | LocationTag::FailedCompile => {}
            LocationTag::Compiled => self.run_compiled(cell, vars),
        }
    }

    fn recording_at(&self, loc: &Location) -> Recording {
        ACTIVE_TRACE.with(|slot| {
            let mut slot = slot.borrow_mut();
            let recording = match slot.as_ref() {
                None => return Recording::None,
                // Left behind by a coordinator that no longer exists.
                Some(active) if active.session.is_closed() => None,
                Some(active) if active.mt_id != self.id => Some(Recording::Foreign),
                Some(active) if Arc::ptr_eq(&active.cell, loc.cell()) => None,
                Some(_) => Some(Recording::Inlined),
            };
            match recording {
                Some(recording) => recording,
                None => match slot.take() {
                    Some(active) if !active.session.is_closed() => Recording::Closing(active),
                    _ => Recording::None,
                },
            }
        })
    }

    fn start_tracing(&self, cell: &Arc<LocationCell>, vars: &ControlPointVars<'_>) {
        let id = cell.id();
        if !self.session.acquire(id) {
            trace!(location = %id, "tracing session busy");
            return;
        }
        match cell.try_step(Transition::StartTracing) {
            Ok(true) => {}
            Ok(false) => {
                self.session.release(id);
                return;
            }
            Err(e) => crate::fatal(format_args!("starting trace at {}: {}", id, e)),
        }

        Counters::bump(&self.counters.traces_started);
        debug!(location = %id, layout = %vars.layout(), "start tracing");
        self.diag.event(JitEvent::StartTracing);

        let active = ActiveTrace {
            mt_id: self.id,
            cell: Arc::clone(cell),
            session: Arc::clone(&self.session),
            counters: Arc::clone(&self.counters),
            recorder: Some(TraceRecorder::new(id, vars.layout(), self.max_trace_len)),
        };
        ACTIVE_TRACE.with(|slot| *slot.borrow_mut() = Some(active));
    }

    fn close_trace(&self, mut active: ActiveTrace) {
        let Some(recorder) = active.recorder.take() else {
            return;
        };
        let trace = match recorder.finish() {
            Ok(trace) => trace,
            Err(reason) => {
                active.abort(reason);
                return;
            }
        };

        let cell = Arc::clone(&active.cell);
        self.diag.event(JitEvent::StopTracing);
        if let Err(e) = cell.try_step(Transition::StopTracing) {
            crate::fatal(format_args!("stopping trace at {}: {}", cell.id(), e));
        }
        self.session.release(cell.id());
        drop(active);

        debug!(location = %cell.id(), ops = trace.len(), guards = trace.guards.len(), "stop tracing");
        if self.diag.wants_ir(IrStage::PreTrace) {
            self.diag.dump_ir(IrStage::PreTrace, &trace.to_string());
        }

        if self.synchronous_compile {
            let result = self.compiler.compile(&trace, &self.diag);
            finish_compile(&cell, result, &self.counters);
        } else {
            self.spawn_compile(trace);
        }
    }

    fn spawn_compile(&self, trace: Trace) {
        let registry = Arc::clone(&self.registry);
        let compiler = Arc::clone(&self.compiler);
        let diag = Arc::clone(&self.diag);
        let counters = Arc::clone(&self.counters);
        self.jobs.begin();
        let guard = JobGuard(Arc::clone(&self.jobs));

        rayon::spawn(move || {
            let _guard = guard;
            let result = compiler.compile(&trace, &diag);
            match registry.get(trace.loc) {
                Some(cell) => finish_compile(&cell, result, &counters),
                None => debug!(location = %trace.loc, "location dropped before its trace compiled"),
            }
        });
    }

    fn run_compiled(&self, cell: &Arc<LocationCell>, vars: &mut ControlPointVars<'_>) {
        let ct = match cell.compiled() {
            Some(ct) => Arc::clone(ct),
            None => crate::fatal(format_args!("{} compiled without an artifact", cell.id())),
        };
        Counters::bump(&self.counters.jit_entries);

        match exec::execute(&ct, vars, &self.diag) {
            ExecOutcome::Completed => vars.set_continuation(Continuation::LoopHeader),
            ExecOutcome::GuardFailed(failure) => {
                Counters::bump(&self.counters.deopts);
                let record = deopt::reconstruct(&ct, &failure).unwrap_or_else(|e| {
                    crate::fatal(format_args!("deoptimising {}: {}", ct.name(), e))
                });
                trace!(location = %cell.id(), guard = failure.guard, frames = record.frames.len(), "deoptimise");
                self.diag.event(JitEvent::Deoptimise);
                if record.is_nested() {
                    self.diag.event(JitEvent::Stopgap);
                }
                if let Err(e) = deopt::restore_outer_frame(&record, vars) {
                    crate::fatal(format_args!("deoptimising {}: {}", ct.name(), e));
                }
                self.diag.event(JitEvent::ExitJitCode);
                vars.set_continuation(Continuation::Resume(record));
            }
        }
    }
}

fn finish_compile(cell: &LocationCell, result: Result<CompiledTrace, CompileError>, counters: &Counters) {
    match result {
        Ok(ct) => {
            Counters::bump(&counters.traces_compiled);
            debug!(location = %cell.id(), trace = ct.name(), "trace installed");
            if let Err(e) = cell.install(Arc::new(ct)) {
                crate::fatal(format_args!("installing trace at {}: {}", cell.id(), e));
            }
        }
        Err(e) => {
            Counters::bump(&counters.compile_failures);
            warn!(location = %cell.id(), error = %e, "trace compilation failed");
            if let Err(e) = cell.try_step(Transition::CompileFailed) {
                crate::fatal(format_args!("failing compile at {}: {}", cell.id(), e));
            }
        }
    }
}

impl Drop for MT {
    fn drop(&mut self) {
        self.abort_tracing();
        self.jobs.wait();
        self.session.closed.store(true, Ordering::Release);
        debug!(mt = self.id, "meta-tracer destroyed");
    }
}

impl fmt::Debug for MT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MT")
            .field("id", &self.id)
            .field("hot_threshold", &self.hot_threshold())
            .field("synchronous_compile", &self.synchronous_compile)
            .field("max_trace_len", &self.max_trace_len)
            .field("locations", &self.registry.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for [`MT`].
pub struct MtBuilder {
    config: MtConfig,
    sink: DiagSink,
    compiler: Option<Arc<dyn TraceCompiler>>,
}

impl Default for MtBuilder {
    fn default() -> Self {
        Self::from_config(MtConfig::default())
    }
}

impl MtBuilder {
    pub fn from_config(config: MtConfig) -> Self {
        MtBuilder {
            config,
            sink: DiagSink::Stderr,
            compiler: None,
        }
    }

    pub fn hot_threshold(mut self, threshold: u32) -> Self {
        self.config.hot_threshold = threshold;
        self
    }

    pub fn synchronous_compile(mut self, enabled: bool) -> Self {
        self.config.synchronous_compile = enabled;
        self
    }

    pub fn print_jitstate(mut self, enabled: bool) -> Self {
        self.config.print_jitstate = enabled;
        self
    }

    pub fn print_ir(mut self, stages: IrStages) -> Self {
        self.config.print_ir = stages;
        self
    }

    pub fn max_trace_len(mut self, len: usize) -> Self {
        self.config.max_trace_len = len;
        self
    }

    pub fn diag_sink(mut self, sink: DiagSink) -> Self {
        self.sink = sink;
        self
    }

    /// Use `compiler` instead of the Cranelift backend.
    pub fn compiler<C: TraceCompiler + 'static>(mut self, compiler: C) -> Self {
        self.compiler = Some(Arc::new(compiler));
        self
    }

    pub fn build(self) -> MT {
        let id = NEXT_MT_ID.fetch_add(1, Ordering::Relaxed);
        let compiler = self
            .compiler
            .unwrap_or_else(|| Arc::new(CraneliftCompiler::new()));
        debug!(mt = id, config = ?self.config, "meta-tracer created");
        MT {
            id,
            hot_threshold: AtomicU32::new(self.config.hot_threshold),
            synchronous_compile: self.config.synchronous_compile,
            max_trace_len: self.config.max_trace_len,
            diag: Arc::new(Diagnostics::new(
                self.config.print_jitstate,
                self.config.print_ir,
                self.sink,
            )),
            registry: Arc::new(LocationRegistry::new()),
            session: Arc::new(TraceSession::default()),
            compiler,
            jobs: Arc::new(CompileTracker::default()),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrlvars::{FuncId, HostCalls, VarLayout, Word};
    use crate::diag::SharedBuffer;
    use crate::location::LocationState;
    use crate::trace::BinOpKind;

    struct NoHost;

    impl HostCalls for NoHost {
        fn call(&mut self, _func: u32, _args: &[Word]) -> Word {
            0
        }
    }

    struct Failing;

    impl TraceCompiler for Failing {
        fn compile(&self, _trace: &Trace, _diag: &Diagnostics) -> Result<CompiledTrace, CompileError> {
            Err(CompileError::Unsupported("nothing".to_string()))
        }
    }

    const LAYOUT: VarLayout = VarLayout {
        func: FuncId(0),
        nslots: 1,
    };

    fn visit(mt: &MT, loc: &Location, slots: &mut [Word]) -> Continuation {
        let mut host = NoHost;
        let mut vars = ControlPointVars::new(LAYOUT, slots, &mut host);
        mt.control_point(loc, &mut vars);
        vars.into_continuation()
    }

    fn sync_mt(threshold: u32) -> (MT, SharedBuffer) {
        let buf = SharedBuffer::new();
        let mt = MT::builder()
            .hot_threshold(threshold)
            .synchronous_compile(true)
            .print_jitstate(true)
            .diag_sink(DiagSink::Buffer(buf.clone()))
            .build();
        (mt, buf)
    }

    #[test]
    fn test_counting_then_tracing() {
        let (mt, _) = sync_mt(2);
        let loc = mt.location_new();
        let mut slots = [0];
        assert!(matches!(loc.state(), LocationState::Fresh));
        visit(&mt, &loc, &mut slots);
        visit(&mt, &loc, &mut slots);
        assert!(matches!(loc.state(), LocationState::Counting(2)));
        assert!(!mt.is_tracing());
        visit(&mt, &loc, &mut slots);
        assert!(matches!(loc.state(), LocationState::Tracing));
        assert!(mt.is_tracing());
        mt.abort_tracing();
        assert!(matches!(loc.state(), LocationState::Counting(0)));
        assert_eq!(mt.stats().trace_aborts, 1);
    }

    #[test]
    fn test_trace_compiles_and_runs() {
        let (mt, buf) = sync_mt(0);
        let loc = mt.location_new();
        let mut slots = [10];

        visit(&mt, &loc, &mut slots);
        assert!(mt.is_tracing());
        // Interpreter executes `r0 = r0 - 1` by hand and reports it.
        mt.record(TraceEvent::Const { dst: 0, value: 1 });
        slots[0] = 1;
        visit(&mt, &loc, &mut slots);
        assert!(!mt.is_tracing());
        assert!(matches!(loc.state(), LocationState::Compiled(_)));

        slots[0] = 5;
        let cont = visit(&mt, &loc, &mut slots);
        assert!(matches!(cont, Continuation::LoopHeader));
        assert_eq!(slots, [1]);
        assert_eq!(
            buf.jit_events(),
            ["start-tracing", "stop-tracing", "enter-jit-code", "exit-jit-code"]
        );
        let stats = mt.stats();
        assert_eq!(stats.traces_started, 1);
        assert_eq!(stats.traces_compiled, 1);
        assert_eq!(stats.jit_entries, 1);
    }

    #[test]
    fn test_guard_failure_resumes() {
        let (mt, buf) = sync_mt(0);
        let loc = mt.location_new();
        let mut slots = [3];
        visit(&mt, &loc, &mut slots);
        mt.record(TraceEvent::Branch {
            pc: 1,
            cond: 0,
            nonzero: true,
        });
        visit(&mt, &loc, &mut slots);

        let mut slots = [0];
        match visit(&mt, &loc, &mut slots) {
            Continuation::Resume(record) => {
                assert_eq!(record.frames.len(), 1);
                assert_eq!(record.frames[0].pc, 1);
                assert_eq!(record.frames[0].locals, vec![0]);
            }
            other => panic!("expected resume, got {:?}", other),
        }
        assert_eq!(
            buf.jit_events()[2..],
            ["enter-jit-code", "deoptimise", "exit-jit-code"]
        );
        assert_eq!(mt.stats().deopts, 1);
    }

    #[test]
    fn test_unsupported_operation_aborts() {
        let (mt, buf) = sync_mt(0);
        let loc = mt.location_new();
        let mut slots = [0];
        visit(&mt, &loc, &mut slots);
        mt.record(TraceEvent::BinOp {
            kind: BinOpKind::Add,
            dst: 0,
            lhs: 0,
            rhs: 0,
        });
        mt.record(TraceEvent::Unsupported { what: "div" });
        assert!(!mt.is_tracing());
        assert!(matches!(loc.state(), LocationState::Counting(0)));
        // Threshold 0: the next visit starts over.
        visit(&mt, &loc, &mut slots);
        assert!(mt.is_tracing());
        mt.abort_tracing();
        assert_eq!(buf.jit_events(), ["start-tracing", "start-tracing"]);
    }

    #[test]
    fn test_compile_failure_is_permanent() {
        let mt = MT::builder()
            .hot_threshold(0)
            .synchronous_compile(true)
            .compiler(Failing)
            .build();
        let loc = mt.location_new();
        let mut slots = [0];
        visit(&mt, &loc, &mut slots);
        visit(&mt, &loc, &mut slots);
        assert!(matches!(loc.state(), LocationState::FailedCompile));
        for _ in 0..5 {
            assert!(matches!(visit(&mt, &loc, &mut slots), Continuation::Interpret));
        }
        assert!(matches!(loc.state(), LocationState::FailedCompile));
        assert_eq!(mt.stats().compile_failures, 1);
        assert_eq!(mt.stats().traces_started, 1);
    }

    #[test]
    fn test_other_locations_are_inlined() {
        let (mt, _) = sync_mt(0);
        let outer = mt.location_new();
        let inner = mt.location_new();
        let mut slots = [0];
        visit(&mt, &outer, &mut slots);
        visit(&mt, &inner, &mut slots);
        assert!(mt.is_tracing());
        assert!(matches!(inner.state(), LocationState::Fresh));
    }

    #[test]
    fn test_async_compilation_converges() {
        let mt = MT::builder().hot_threshold(0).build();
        let loc = mt.location_new();
        let mut slots = [0];
        visit(&mt, &loc, &mut slots);
        visit(&mt, &loc, &mut slots);
        mt.wait_for_compilation();
        assert_eq!(mt.compiles_in_flight(), 0);
        assert!(matches!(loc.state(), LocationState::Compiled(_)));
    }

    #[test]
    fn test_set_hot_threshold() {
        let mt = MT::new(MtConfig::default());
        assert_eq!(mt.hot_threshold(), 50);
        mt.set_hot_threshold(7);
        assert_eq!(mt.hot_threshold(), 7);
    }

    #[test]
    fn test_dropping_mt_clears_stale_recording() {
        let loc_state = {
            let (mt, _) = sync_mt(0);
            let loc = mt.location_new();
            let mut slots = [0];
            visit(&mt, &loc, &mut slots);
            assert!(mt.is_tracing());
            drop(mt);
            loc.state().tag()
        };
        assert_eq!(loc_state, LocationTag::Counting);

        let (mt, _) = sync_mt(0);
        let loc = mt.location_new();
        let mut slots = [0];
        visit(&mt, &loc, &mut slots);
        assert!(mt.is_tracing());
    }
}
