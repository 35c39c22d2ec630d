//! Execution engine
//!
//! Runs a compiled trace against the control-point variables and reports
//! whether it completed or left through a guard.

use smallvec::{smallvec, SmallVec};
use tracing::trace;

use crate::ctrlvars::{ControlPointVars, Word};
use crate::diag::{Diagnostics, JitEvent};
use crate::jit::CompiledTrace;
use crate::trace::GuardId;

/// Snapshot buffer; most traces fit without a heap allocation.
pub type Snapshot = SmallVec<[Word; 32]>;

/// A side exit taken by a compiled trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFailure {
    pub guard: GuardId,
    /// Value of every trace variable of every frame active at the guard,
    /// indexed by trace variable.
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// One full iteration ran; the variables hold the post-trace values.
    Completed,
    GuardFailed(GuardFailure),
}

/// Execute `ct` once.
///
/// Emits `enter-jit-code`, and `exit-jit-code` when the trace completes. On a
/// guard failure the caller owns the rest of the event sequence.
pub fn execute(ct: &CompiledTrace, vars: &mut ControlPointVars<'_>, diag: &Diagnostics) -> ExecOutcome {
    if vars.layout() != ct.layout() {
        crate::fatal(format_args!(
            "{} entered with control-point variables {} but was recorded with {}",
            ct.name(),
            vars.layout(),
            ct.layout()
        ));
    }

    let mut deopt: Snapshot = smallvec![0; ct.nvars() as usize];
    let (slots, host) = vars.raw_parts();

    diag.event(JitEvent::EnterJitCode);
    // SAFETY: the layout check above guarantees `slots` has the entry frame's
    // size, `deopt` covers every trace variable, and `host` points at the
    // live host reference inside `vars`.
    let code = unsafe { (ct.entry())(slots, deopt.as_mut_ptr(), host) };

    if code == 0 {
        diag.event(JitEvent::ExitJitCode);
        return ExecOutcome::Completed;
    }

    let guard = (code - 1) as GuardId;
    trace!(trace = ct.name(), guard, "guard failed");
    ExecOutcome::GuardFailed(GuardFailure {
        guard,
        snapshot: deopt,
    })
}
