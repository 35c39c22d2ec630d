//! Textual form of the trace IR, as printed by the `pre-trace-ir` dump.
//!
//! ```text
//! trace loc1 entry f0[3 slots] vars 3
//!   live-in: v0 v1
//!   live-out: v0
//!   v0 = sub v0, v2
//!   guard #0 nonzero v0 [f0@4]
//! ```

use std::fmt;

use itertools::Itertools;

use super::{GuardCheck, GuardSite, Trace, TraceOp, TraceOperand, VarIdx};

struct Vars<'a>(&'a [VarIdx]);

impl fmt::Display for Vars<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        write!(f, "{}", self.0.iter().map(|v| format!("v{}", v)).join(" "))
    }
}

impl fmt::Display for TraceOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOperand::Var(v) => write!(f, "v{}", v),
            TraceOperand::Const(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for GuardCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardCheck::NonZero => f.write_str("nonzero"),
            GuardCheck::Zero => f.write_str("zero"),
            GuardCheck::Equals(v) => write!(f, "eq {}", v),
            GuardCheck::NoneOf(cases) => write!(f, "none-of {{{}}}", cases.iter().join(", ")),
        }
    }
}

impl fmt::Display for GuardSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.frames
                .iter()
                .map(|frame| format!("{}@{}", frame.func, frame.pc))
                .join(" > ")
        )
    }
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOp::Const { dst, value } => write!(f, "v{} = const {}", dst, value),
            TraceOp::Copy { dst, src } => write!(f, "v{} = v{}", dst, src),
            TraceOp::BinOp { kind, dst, lhs, rhs } => {
                write!(f, "v{} = {} v{}, v{}", dst, kind.mnemonic(), lhs, rhs)
            }
            TraceOp::CopyBytes { dst, src, len } => {
                write!(f, "v{} = copy-bytes v{}, v{}, {}", dst, dst, src, len)
            }
            TraceOp::HostCall { func, args, dst } => {
                if let Some(dst) = dst {
                    write!(f, "v{} = ", dst)?;
                }
                write!(f, "host #{}({})", func, args.iter().join(", "))
            }
            TraceOp::Guard { id, var, check } => write!(f, "guard #{} {} v{}", id, check, var),
            TraceOp::EnterFrame { func, base, nlocals } => {
                write!(f, "enter {} v{}..v{}", func, base, base + nlocals)
            }
            TraceOp::LeaveFrame => f.write_str("leave"),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace {} entry {} vars {}", self.loc, self.entry, self.nvars)?;
        writeln!(f, "  live-in: {}", Vars(&self.live_in))?;
        writeln!(f, "  live-out: {}", Vars(&self.live_out))?;
        let mut depth = 0usize;
        for op in &self.ops {
            if matches!(op, TraceOp::LeaveFrame) {
                depth = depth.saturating_sub(1);
            }
            write!(f, "  {:indent$}{}", "", op, indent = depth * 2)?;
            if let TraceOp::Guard { id, .. } = op {
                if let Some(site) = self.guards.get(*id as usize) {
                    write!(f, " {}", site)?;
                }
            }
            writeln!(f)?;
            if matches!(op, TraceOp::EnterFrame { .. }) {
                depth += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BinOpKind, FrameSite};
    use super::*;
    use crate::ctrlvars::{FuncId, VarLayout};
    use crate::location::LocationId;

    #[test]
    fn test_render_trace() {
        let ops = vec![
            TraceOp::BinOp {
                kind: BinOpKind::Sub,
                dst: 0,
                lhs: 0,
                rhs: 1,
            },
            TraceOp::Guard {
                id: 0,
                var: 0,
                check: GuardCheck::NonZero,
            },
            TraceOp::EnterFrame {
                func: FuncId(1),
                base: 2,
                nlocals: 1,
            },
            TraceOp::Copy { dst: 2, src: 0 },
            TraceOp::LeaveFrame,
        ];
        let guards = vec![GuardSite {
            frames: vec![FrameSite {
                func: FuncId(0),
                pc: 4,
                base: 0,
                nlocals: 2,
                ret: None,
            }],
        }];
        let trace = Trace::finish(
            LocationId::from_raw(1),
            VarLayout::new(FuncId(0), 2),
            ops,
            guards,
            3,
        );
        let text = trace.to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "trace loc1 entry f0[2 slots] vars 3");
        assert_eq!(lines[1], "  live-in: v0 v1");
        assert_eq!(lines[2], "  live-out: v0");
        assert_eq!(lines[3], "  v0 = sub v0, v1");
        assert_eq!(lines[4], "  guard #0 nonzero v0 [f0@4]");
        assert_eq!(lines[5], "  enter f1 v2..v3");
        assert_eq!(lines[6], "    v2 = v0");
        assert_eq!(lines[7], "  leave");
    }

    #[test]
    fn test_render_switch_guard() {
        let check = GuardCheck::NoneOf(vec![100, 200]);
        assert_eq!(check.to_string(), "none-of {100, 200}");
        assert_eq!(GuardCheck::Equals(300).to_string(), "eq 300");
    }
}
