//! Trace recording
//!
//! The host interpreter reports every operation it executes while a trace is
//! being recorded. The recorder maps frame-local registers onto trace
//! variables, inlines calls, turns control flow into guards and gives up on
//! anything it cannot express.

use std::fmt;

use smallvec::SmallVec;
use tracing::trace;

use super::{
    BinOpKind, FrameSite, GuardCheck, GuardId, GuardSite, Trace, TraceOp, TraceOperand, VarIdx,
};
use crate::ctrlvars::{FuncId, Pc, Reg, VarLayout, Word};
use crate::location::LocationId;

/// Upper bound on trace variables, counting every inlined frame.
pub const MAX_TRACE_VARS: u32 = 4096;

/// Operand of a host call as the interpreter sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(Word),
}

/// An executed operation, reported by the host interpreter.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'a> {
    Const {
        dst: Reg,
        value: Word,
    },
    Move {
        dst: Reg,
        src: Reg,
    },
    BinOp {
        kind: BinOpKind,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    CopyBytes {
        dst: Reg,
        src: Reg,
        len: u8,
    },
    /// A conditional branch at `pc` tested `cond` and found it `nonzero` or not.
    Branch {
        pc: Pc,
        cond: Reg,
        nonzero: bool,
    },
    /// A switch at `pc` on `discr`, which held `value`; `arm` is the index of
    /// the case taken, `None` for the default arm.
    Switch {
        pc: Pc,
        discr: Reg,
        value: Word,
        cases: &'a [Word],
        arm: Option<usize>,
    },
    /// A call at `pc`; the callee's first `args.len()` locals are its parameters.
    Call {
        pc: Pc,
        callee: FuncId,
        nlocals: u32,
        args: &'a [Reg],
        ret: Option<Reg>,
    },
    Return {
        value: Option<Reg>,
    },
    HostCall {
        func: u32,
        args: &'a [Operand],
        dst: Option<Reg>,
    },
    /// Something the trace IR cannot express.
    Unsupported {
        what: &'a str,
    },
}

/// Why a recording was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceAbort {
    Unsupported(String),
    ReturnFromOutermostFrame,
    ClosedInInlinedFrame { depth: usize },
    TooLong { limit: usize },
    TooManyVars { limit: u32 },
    BadRegister { reg: Reg, nlocals: u32 },
    BadSwitchArm { value: Word },
    BadCall { nargs: usize, nlocals: u32 },
    /// The recording was abandoned by the host or by its thread exiting.
    Abandoned,
}

impl fmt::Display for TraceAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceAbort::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            TraceAbort::ReturnFromOutermostFrame => {
                write!(f, "returned out of the frame the trace started in")
            }
            TraceAbort::ClosedInInlinedFrame { depth } => {
                write!(f, "loop closed inside an inlined call (depth {})", depth)
            }
            TraceAbort::TooLong { limit } => write!(f, "trace longer than {} ops", limit),
            TraceAbort::TooManyVars { limit } => {
                write!(f, "trace needs more than {} variables", limit)
            }
            TraceAbort::BadRegister { reg, nlocals } => {
                write!(f, "register r{} out of range for a frame of {} locals", reg, nlocals)
            }
            TraceAbort::BadSwitchArm { value } => {
                write!(f, "switch arm does not match discriminant {}", value)
            }
            TraceAbort::BadCall { nargs, nlocals } => {
                write!(f, "call passes {} arguments to a frame of {} locals", nargs, nlocals)
            }
            TraceAbort::Abandoned => write!(f, "recording abandoned"),
        }
    }
}

impl std::error::Error for TraceAbort {}

#[derive(Debug, Clone)]
struct RecFrame {
    func: FuncId,
    base: VarIdx,
    nlocals: u32,
    ret: Option<Reg>,
    /// Set while this frame has an inlined callee: the pc to return to.
    resume_pc: Option<Pc>,
}

/// Records one trace for one Location.
#[derive(Debug)]
pub struct TraceRecorder {
    loc: LocationId,
    entry: VarLayout,
    frames: Vec<RecFrame>,
    ops: Vec<TraceOp>,
    guards: Vec<GuardSite>,
    nvars: u32,
    max_len: usize,
}

impl TraceRecorder {
    pub fn new(loc: LocationId, entry: VarLayout, max_len: usize) -> Self {
        TraceRecorder {
            loc,
            entry,
            frames: vec![RecFrame {
                func: entry.func,
                base: 0,
                nlocals: entry.nslots,
                ret: None,
                resume_pc: None,
            }],
            ops: Vec::new(),
            guards: Vec::new(),
            nvars: entry.nslots,
            max_len,
        }
    }

    pub fn loc(&self) -> LocationId {
        self.loc
    }

    pub fn entry(&self) -> VarLayout {
        self.entry
    }

    /// Number of inlined frames above the one the trace started in.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn record(&mut self, event: TraceEvent<'_>) -> Result<(), TraceAbort> {
        match event {
            TraceEvent::Const { dst, value } => {
                let dst = self.var(dst)?;
                self.push(TraceOp::Const { dst, value })
            }
            TraceEvent::Move { dst, src } => {
                let (dst, src) = (self.var(dst)?, self.var(src)?);
                self.push(TraceOp::Copy { dst, src })
            }
            TraceEvent::BinOp { kind, dst, lhs, rhs } => {
                let (dst, lhs, rhs) = (self.var(dst)?, self.var(lhs)?, self.var(rhs)?);
                self.push(TraceOp::BinOp { kind, dst, lhs, rhs })
            }
            TraceEvent::CopyBytes { dst, src, len } => {
                let (dst, src) = (self.var(dst)?, self.var(src)?);
                self.push(TraceOp::CopyBytes { dst, src, len })
            }
            TraceEvent::Branch { pc, cond, nonzero } => {
                let check = if nonzero {
                    GuardCheck::NonZero
                } else {
                    GuardCheck::Zero
                };
                self.guard(pc, cond, check)
            }
            TraceEvent::Switch {
                pc,
                discr,
                value,
                cases,
                arm,
            } => {
                let check = match arm {
                    Some(i) if cases.get(i) == Some(&value) => GuardCheck::Equals(value),
                    None if !cases.contains(&value) => GuardCheck::NoneOf(cases.to_vec()),
                    _ => return Err(TraceAbort::BadSwitchArm { value }),
                };
                self.guard(pc, discr, check)
            }
            TraceEvent::Call {
                pc,
                callee,
                nlocals,
                args,
                ret,
            } => self.enter(pc, callee, nlocals, args, ret),
            TraceEvent::Return { value } => self.leave(value),
            TraceEvent::HostCall { func, args, dst } => {
                let args = args
                    .iter()
                    .map(|a| match *a {
                        Operand::Reg(r) => self.var(r).map(TraceOperand::Var),
                        Operand::Imm(v) => Ok(TraceOperand::Const(v)),
                    })
                    .collect::<Result<SmallVec<[TraceOperand; 4]>, _>>()?;
                let dst = dst.map(|r| self.var(r)).transpose()?;
                self.push(TraceOp::HostCall { func, args, dst })
            }
            TraceEvent::Unsupported { what } => Err(TraceAbort::Unsupported(what.to_string())),
        }
    }

    /// Close the recording at the Location it started from.
    pub fn finish(self) -> Result<Trace, TraceAbort> {
        if self.depth() > 0 {
            return Err(TraceAbort::ClosedInInlinedFrame {
                depth: self.depth(),
            });
        }
        trace!(
            location = %self.loc,
            ops = self.ops.len(),
            guards = self.guards.len(),
            "trace closed"
        );
        Ok(Trace::finish(
            self.loc,
            self.entry,
            self.ops,
            self.guards,
            self.nvars,
        ))
    }

    fn top(&self) -> &RecFrame {
        // The entry frame is never popped.
        &self.frames[self.frames.len() - 1]
    }

    fn var(&self, reg: Reg) -> Result<VarIdx, TraceAbort> {
        let frame = self.top();
        if reg >= frame.nlocals {
            return Err(TraceAbort::BadRegister {
                reg,
                nlocals: frame.nlocals,
            });
        }
        Ok(frame.base + reg)
    }

    fn push(&mut self, op: TraceOp) -> Result<(), TraceAbort> {
        if self.ops.len() >= self.max_len {
            return Err(TraceAbort::TooLong {
                limit: self.max_len,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    fn guard(&mut self, pc: Pc, reg: Reg, check: GuardCheck) -> Result<(), TraceAbort> {
        let var = self.var(reg)?;
        let id = self.guards.len() as GuardId;
        let innermost = self.frames.len() - 1;
        let frames = self
            .frames
            .iter()
            .enumerate()
            .map(|(i, f)| FrameSite {
                func: f.func,
                pc: if i == innermost {
                    pc
                } else {
                    f.resume_pc.unwrap_or(pc)
                },
                base: f.base,
                nlocals: f.nlocals,
                ret: f.ret,
            })
            .collect();
        self.push(TraceOp::Guard { id, var, check })?;
        self.guards.push(GuardSite { frames });
        Ok(())
    }

    fn enter(
        &mut self,
        pc: Pc,
        callee: FuncId,
        nlocals: u32,
        args: &[Reg],
        ret: Option<Reg>,
    ) -> Result<(), TraceAbort> {
        if args.len() > nlocals as usize {
            return Err(TraceAbort::BadCall {
                nargs: args.len(),
                nlocals,
            });
        }
        if let Some(r) = ret {
            self.var(r)?;
        }
        let srcs = args
            .iter()
            .map(|&r| self.var(r))
            .collect::<Result<SmallVec<[VarIdx; 4]>, _>>()?;

        let base = self.nvars;
        let end = base
            .checked_add(nlocals)
            .filter(|&end| end <= MAX_TRACE_VARS)
            .ok_or(TraceAbort::TooManyVars {
                limit: MAX_TRACE_VARS,
            })?;
        self.nvars = end;

        self.push(TraceOp::EnterFrame {
            func: callee,
            base,
            nlocals,
        })?;
        for (i, src) in srcs.iter().enumerate() {
            self.push(TraceOp::Copy {
                dst: base + i as VarIdx,
                src: *src,
            })?;
        }
        for local in srcs.len() as u32..nlocals {
            self.push(TraceOp::Const {
                dst: base + local,
                value: 0,
            })?;
        }

        let caller = self.frames.len() - 1;
        self.frames[caller].resume_pc = Some(pc + 1);
        self.frames.push(RecFrame {
            func: callee,
            base,
            nlocals,
            ret,
            resume_pc: None,
        });
        Ok(())
    }

    fn leave(&mut self, value: Option<Reg>) -> Result<(), TraceAbort> {
        if self.depth() == 0 {
            return Err(TraceAbort::ReturnFromOutermostFrame);
        }
        let src = value.map(|r| self.var(r)).transpose()?;
        let callee = self.top().clone();
        let caller = &self.frames[self.frames.len() - 2];
        let dst = callee.ret.map(|r| caller.base + r);

        match (dst, src) {
            (Some(dst), Some(src)) => self.push(TraceOp::Copy { dst, src })?,
            (Some(dst), None) => self.push(TraceOp::Const { dst, value: 0 })?,
            (None, _) => {}
        }
        self.push(TraceOp::LeaveFrame)?;

        self.frames.pop();
        let caller = self.frames.len() - 1;
        self.frames[caller].resume_pc = None;
        Ok(())
    }
}
