//! Trace IR
//!
//! A trace is a straight-line sequence of operations over numbered trace
//! variables. Variables `0..entry.nslots` are the control-point variables of
//! the frame the trace started in; every inlined call gets a fresh range above
//! them. Control flow the trace depended on is re-checked by guards; a failing
//! guard leaves the trace through a side exit described by its [`GuardSite`].

pub mod display;
pub mod recorder;

use smallvec::SmallVec;

use crate::ctrlvars::{FuncId, Pc, Reg, VarLayout, Word};
use crate::location::LocationId;

pub use recorder::{Operand, TraceAbort, TraceEvent, TraceRecorder, MAX_TRACE_VARS};

/// Index of a trace variable.
pub type VarIdx = u32;

/// Index into [`Trace::guards`].
pub type GuardId = u32;

/// Binary operators. Arithmetic wraps; comparisons produce 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOpKind {
    pub fn eval(self, lhs: Word, rhs: Word) -> Word {
        match self {
            BinOpKind::Add => lhs.wrapping_add(rhs),
            BinOpKind::Sub => lhs.wrapping_sub(rhs),
            BinOpKind::Mul => lhs.wrapping_mul(rhs),
            BinOpKind::And => lhs & rhs,
            BinOpKind::Or => lhs | rhs,
            BinOpKind::Xor => lhs ^ rhs,
            BinOpKind::Eq => (lhs == rhs) as Word,
            BinOpKind::Ne => (lhs != rhs) as Word,
            BinOpKind::Lt => (lhs < rhs) as Word,
            BinOpKind::Le => (lhs <= rhs) as Word,
            BinOpKind::Gt => (lhs > rhs) as Word,
            BinOpKind::Ge => (lhs >= rhs) as Word,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOpKind::Add => "add",
            BinOpKind::Sub => "sub",
            BinOpKind::Mul => "mul",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
            BinOpKind::Xor => "xor",
            BinOpKind::Eq => "eq",
            BinOpKind::Ne => "ne",
            BinOpKind::Lt => "lt",
            BinOpKind::Le => "le",
            BinOpKind::Gt => "gt",
            BinOpKind::Ge => "ge",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Some(match s {
            "add" => BinOpKind::Add,
            "sub" => BinOpKind::Sub,
            "mul" => BinOpKind::Mul,
            "and" => BinOpKind::And,
            "or" => BinOpKind::Or,
            "xor" => BinOpKind::Xor,
            "eq" => BinOpKind::Eq,
            "ne" => BinOpKind::Ne,
            "lt" => BinOpKind::Lt,
            "le" => BinOpKind::Le,
            "gt" => BinOpKind::Gt,
            "ge" => BinOpKind::Ge,
            _ => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOpKind::Eq | BinOpKind::Ne | BinOpKind::Lt | BinOpKind::Le | BinOpKind::Gt | BinOpKind::Ge
        )
    }
}

/// Mask selecting the low `len` bytes of a word.
pub fn byte_mask(len: u8) -> Word {
    if len >= 8 {
        -1
    } else {
        ((1i64 << (8 * len as u32)) - 1) as Word
    }
}

/// Copy the low `len` bytes of `src` over `dst`.
pub fn copy_bytes(dst: Word, src: Word, len: u8) -> Word {
    let mask = byte_mask(len);
    (dst & !mask) | (src & mask)
}

/// Condition a guard re-checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardCheck {
    NonZero,
    Zero,
    /// The switch discriminant selected this case value.
    Equals(Word),
    /// The switch discriminant took the default arm.
    NoneOf(Vec<Word>),
}

impl GuardCheck {
    pub fn holds(&self, v: Word) -> bool {
        match self {
            GuardCheck::NonZero => v != 0,
            GuardCheck::Zero => v == 0,
            GuardCheck::Equals(expected) => v == *expected,
            GuardCheck::NoneOf(cases) => !cases.contains(&v),
        }
    }
}

/// Operand of a host call inside a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOperand {
    Var(VarIdx),
    Const(Word),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOp {
    Const {
        dst: VarIdx,
        value: Word,
    },
    Copy {
        dst: VarIdx,
        src: VarIdx,
    },
    BinOp {
        kind: BinOpKind,
        dst: VarIdx,
        lhs: VarIdx,
        rhs: VarIdx,
    },
    /// Overwrite the low `len` bytes of `dst` with those of `src`.
    CopyBytes {
        dst: VarIdx,
        src: VarIdx,
        len: u8,
    },
    HostCall {
        func: u32,
        args: SmallVec<[TraceOperand; 4]>,
        dst: Option<VarIdx>,
    },
    Guard {
        id: GuardId,
        var: VarIdx,
        check: GuardCheck,
    },
    /// An inlined call begins; its locals are `base..base + nlocals`.
    EnterFrame {
        func: FuncId,
        base: VarIdx,
        nlocals: u32,
    },
    LeaveFrame,
}

impl TraceOp {
    /// Variable written by this op.
    pub fn def(&self) -> Option<VarIdx> {
        match self {
            TraceOp::Const { dst, .. }
            | TraceOp::Copy { dst, .. }
            | TraceOp::BinOp { dst, .. }
            | TraceOp::CopyBytes { dst, .. } => Some(*dst),
            TraceOp::HostCall { dst, .. } => *dst,
            TraceOp::Guard { .. } | TraceOp::EnterFrame { .. } | TraceOp::LeaveFrame => None,
        }
    }

    /// Variables read by this op, in operand order.
    pub fn uses(&self) -> SmallVec<[VarIdx; 4]> {
        match self {
            TraceOp::Const { .. } | TraceOp::EnterFrame { .. } | TraceOp::LeaveFrame => {
                SmallVec::new()
            }
            TraceOp::Copy { src, .. } => SmallVec::from_slice(&[*src]),
            TraceOp::BinOp { lhs, rhs, .. } => SmallVec::from_slice(&[*lhs, *rhs]),
            TraceOp::CopyBytes { dst, src, .. } => SmallVec::from_slice(&[*dst, *src]),
            TraceOp::HostCall { args, .. } => args
                .iter()
                .filter_map(|a| match a {
                    TraceOperand::Var(v) => Some(*v),
                    TraceOperand::Const(_) => None,
                })
                .collect(),
            TraceOp::Guard { var, .. } => SmallVec::from_slice(&[*var]),
        }
    }
}

/// One logical interpreter frame active at a guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSite {
    pub func: FuncId,
    /// Where the interpreter resumes in this frame: the guarded instruction for
    /// the innermost frame, the instruction after the call for the others.
    pub pc: Pc,
    /// First trace variable holding this frame's locals.
    pub base: VarIdx,
    pub nlocals: u32,
    /// Caller register receiving this frame's return value.
    pub ret: Option<Reg>,
}

/// The frame stack recorded for a guard, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSite {
    pub frames: Vec<FrameSite>,
}

impl GuardSite {
    /// Whether the guard sits inside an inlined call.
    pub fn is_nested(&self) -> bool {
        self.frames.len() > 1
    }

    pub fn innermost(&self) -> Option<&FrameSite> {
        self.frames.last()
    }

    /// Number of snapshot words a side exit through this guard needs.
    pub fn snapshot_len(&self) -> usize {
        self.frames
            .iter()
            .map(|f| (f.base + f.nlocals) as usize)
            .max()
            .unwrap_or(0)
    }
}

/// A closed trace ready for compilation.
#[derive(Debug, Clone)]
pub struct Trace {
    pub loc: LocationId,
    pub entry: VarLayout,
    pub ops: Vec<TraceOp>,
    pub guards: Vec<GuardSite>,
    pub nvars: u32,
    /// Control-point variables read before the trace writes them.
    pub live_in: Vec<VarIdx>,
    /// Control-point variables the trace writes.
    pub live_out: Vec<VarIdx>,
}

impl Trace {
    /// Assemble a trace and compute its live sets.
    pub fn finish(
        loc: LocationId,
        entry: VarLayout,
        ops: Vec<TraceOp>,
        guards: Vec<GuardSite>,
        nvars: u32,
    ) -> Self {
        let nslots = entry.nslots as usize;
        let mut read = vec![false; nslots];
        let mut written = vec![false; nslots];

        for op in &ops {
            for v in op.uses() {
                let v = v as usize;
                if v < nslots && !written[v] {
                    read[v] = true;
                }
            }
            if let Some(d) = op.def() {
                if (d as usize) < nslots {
                    written[d as usize] = true;
                }
            }
        }

        let collect = |flags: &[bool]| {
            flags
                .iter()
                .enumerate()
                .filter(|(_, set)| **set)
                .map(|(i, _)| i as VarIdx)
                .collect::<Vec<_>>()
        };

        Trace {
            loc,
            entry,
            live_in: collect(&read),
            live_out: collect(&written),
            ops,
            guards,
            nvars,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
