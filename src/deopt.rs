//! Deoptimisation
//!
//! Turns a guard failure into interpreter state: one [`FrameState`] per
//! logical frame that was active at the guard, outermost first. The outermost
//! frame is the one that owns the control-point variables; the others were
//! inlined into the trace and have to be rebuilt by the interpreter.

use std::fmt;

use crate::ctrlvars::{ControlPointVars, FuncId, Pc, Reg, VarLayout, Word};
use crate::exec::GuardFailure;
use crate::jit::CompiledTrace;
use crate::trace::GuardId;

/// Interpreter state of one frame at a side exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameState {
    pub func: FuncId,
    /// Instruction to resume at.
    pub pc: Pc,
    pub locals: Vec<Word>,
    /// Caller register receiving this frame's return value.
    pub ret: Option<Reg>,
}

/// Everything the interpreter needs to continue after a guard failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionRecord {
    pub guard: GuardId,
    pub frames: Vec<FrameState>,
}

impl ResumptionRecord {
    /// Whether inlined frames have to be rebuilt on top of the outer one.
    pub fn is_nested(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn outermost(&self) -> Option<&FrameState> {
        self.frames.first()
    }

    pub fn innermost(&self) -> Option<&FrameState> {
        self.frames.last()
    }
}

/// A snapshot or record that does not fit the shape it is applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutMismatch {
    UnknownGuard { guard: GuardId, nguards: usize },
    EmptyGuardSite { guard: GuardId },
    ShortSnapshot { needed: usize, got: usize },
    OuterFrame { expected: VarLayout, got: VarLayout },
}

impl fmt::Display for LayoutMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutMismatch::UnknownGuard { guard, nguards } => {
                write!(f, "guard #{} out of range ({} guards)", guard, nguards)
            }
            LayoutMismatch::EmptyGuardSite { guard } => {
                write!(f, "guard #{} has no frames", guard)
            }
            LayoutMismatch::ShortSnapshot { needed, got } => {
                write!(f, "snapshot of {} words, need {}", got, needed)
            }
            LayoutMismatch::OuterFrame { expected, got } => {
                write!(f, "outer frame is {}, control point has {}", got, expected)
            }
        }
    }
}

impl std::error::Error for LayoutMismatch {}

/// Build the resumption record for `failure`.
pub fn reconstruct(
    ct: &CompiledTrace,
    failure: &GuardFailure,
) -> Result<ResumptionRecord, LayoutMismatch> {
    let site = ct.guard(failure.guard).ok_or(LayoutMismatch::UnknownGuard {
        guard: failure.guard,
        nguards: ct.guards().len(),
    })?;
    if site.frames.is_empty() {
        return Err(LayoutMismatch::EmptyGuardSite {
            guard: failure.guard,
        });
    }
    let needed = site.snapshot_len();
    if failure.snapshot.len() < needed {
        return Err(LayoutMismatch::ShortSnapshot {
            needed,
            got: failure.snapshot.len(),
        });
    }

    let frames = site
        .frames
        .iter()
        .map(|frame| {
            let start = frame.base as usize;
            let end = start + frame.nlocals as usize;
            FrameState {
                func: frame.func,
                pc: frame.pc,
                locals: failure.snapshot[start..end].to_vec(),
                ret: frame.ret,
            }
        })
        .collect();

    Ok(ResumptionRecord {
        guard: failure.guard,
        frames,
    })
}

/// Write the outermost frame of `record` back into the control-point variables.
pub fn restore_outer_frame(
    record: &ResumptionRecord,
    vars: &mut ControlPointVars<'_>,
) -> Result<(), LayoutMismatch> {
    let outer = record.outermost().ok_or(LayoutMismatch::EmptyGuardSite {
        guard: record.guard,
    })?;
    let got = VarLayout::new(outer.func, outer.locals.len() as u32);
    if got != vars.layout() {
        return Err(LayoutMismatch::OuterFrame {
            expected: vars.layout(),
            got,
        });
    }
    vars.slots_mut().copy_from_slice(&outer.locals);
    Ok(())
}
