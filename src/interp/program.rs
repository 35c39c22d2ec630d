//! Program model of the demo interpreter
//!
//! A register machine: every function has a fixed number of word-sized locals,
//! the first `nparams` of which receive the call's arguments.

use std::fmt;
use std::io;

use crate::ctrlvars::{FuncId, Pc, Reg, Word};
use crate::trace::{BinOpKind, Operand};

/// Side-effecting operations the interpreter offers through host calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HostFn {
    /// Print the string with index `args[0]`.
    PrintStr = 0,
    /// Print `args[0]` as a decimal integer.
    PrintInt = 1,
    /// Print `<string args[0]>=<args[1]>`.
    PrintLabeled = 2,
}

impl HostFn {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HostFn::PrintStr),
            1 => Some(HostFn::PrintInt),
            2 => Some(HostFn::PrintLabeled),
            _ => None,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            HostFn::PrintStr | HostFn::PrintInt => 1,
            HostFn::PrintLabeled => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
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
    /// Signed division; not expressible in traces.
    Div {
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    CopyBytes {
        dst: Reg,
        src: Reg,
        len: u8,
    },
    Jump {
        target: Pc,
    },
    /// Jump to `target` when `cond` is non-zero (`when_nonzero`) or zero.
    Branch {
        cond: Reg,
        target: Pc,
        when_nonzero: bool,
    },
    Switch {
        discr: Reg,
        values: Vec<Word>,
        targets: Vec<Pc>,
        default: Pc,
    },
    Call {
        func: FuncId,
        args: Vec<Reg>,
        ret: Option<Reg>,
    },
    Return {
        value: Option<Reg>,
    },
    Host {
        func: HostFn,
        args: Vec<Operand>,
        dst: Option<Reg>,
    },
    /// A meta-tracing control point for the program's Location number `loc`.
    ControlPoint {
        loc: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub nlocals: u32,
    pub nparams: u32,
    pub code: Vec<Instr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub functions: Vec<Function>,
    pub strings: Vec<String>,
    pub entry: FuncId,
}

impl Program {
    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    /// Number of distinct control points the program refers to.
    pub fn num_locations(&self) -> usize {
        self.functions
            .iter()
            .flat_map(|f| f.code.iter())
            .filter_map(|instr| match instr {
                Instr::ControlPoint { loc } => Some(loc + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Check every register, jump target, callee and string the program uses.
    pub fn validate(&self) -> Result<(), VmError> {
        if self.function(self.entry).is_none() {
            return Err(VmError::UnknownFunction(self.entry));
        }
        for (fi, func) in self.functions.iter().enumerate() {
            let fid = FuncId(fi as u32);
            if func.nparams > func.nlocals {
                return Err(VmError::Malformed {
                    func: fid,
                    pc: 0,
                    what: "more parameters than locals",
                });
            }
            let ncode = func.code.len() as Pc;
            for (pc, instr) in func.code.iter().enumerate() {
                let pc = pc as Pc;
                let reg = |r: Reg| {
                    if r < func.nlocals {
                        Ok(())
                    } else {
                        Err(VmError::BadRegister { func: fid, pc, reg: r })
                    }
                };
                let target = |t: Pc| {
                    if t < ncode {
                        Ok(())
                    } else {
                        Err(VmError::BadTarget { func: fid, pc, target: t })
                    }
                };
                match instr {
                    Instr::Const { dst, .. } => reg(*dst)?,
                    Instr::Move { dst, src } | Instr::CopyBytes { dst, src, .. } => {
                        reg(*dst)?;
                        reg(*src)?;
                    }
                    Instr::BinOp { dst, lhs, rhs, .. } | Instr::Div { dst, lhs, rhs } => {
                        reg(*dst)?;
                        reg(*lhs)?;
                        reg(*rhs)?;
                    }
                    Instr::Jump { target: t } => target(*t)?,
                    Instr::Branch { cond, target: t, .. } => {
                        reg(*cond)?;
                        target(*t)?;
                    }
                    Instr::Switch {
                        discr,
                        values,
                        targets,
                        default,
                    } => {
                        reg(*discr)?;
                        if values.len() != targets.len() {
                            return Err(VmError::Malformed {
                                func: fid,
                                pc,
                                what: "switch cases and targets differ in length",
                            });
                        }
                        for t in targets {
                            target(*t)?;
                        }
                        target(*default)?;
                    }
                    Instr::Call { func: callee, args, ret } => {
                        let callee_fn = self
                            .function(*callee)
                            .ok_or(VmError::UnknownFunction(*callee))?;
                        if args.len() != callee_fn.nparams as usize {
                            return Err(VmError::BadArity {
                                func: *callee,
                                expected: callee_fn.nparams as usize,
                                got: args.len(),
                            });
                        }
                        for a in args {
                            reg(*a)?;
                        }
                        if let Some(r) = ret {
                            reg(*r)?;
                        }
                    }
                    Instr::Return { value } => {
                        if let Some(r) = value {
                            reg(*r)?;
                        }
                    }
                    Instr::Host { func: host, args, dst } => {
                        if args.len() != host.arity() {
                            return Err(VmError::Malformed {
                                func: fid,
                                pc,
                                what: "host call arity",
                            });
                        }
                        for a in args {
                            if let Operand::Reg(r) = a {
                                reg(*r)?;
                            }
                        }
                        let string_arg = match host {
                            HostFn::PrintStr | HostFn::PrintLabeled => args.first(),
                            HostFn::PrintInt => None,
                        };
                        if let Some(Operand::Imm(idx)) = string_arg {
                            if *idx < 0 || *idx as usize >= self.strings.len() {
                                return Err(VmError::Malformed {
                                    func: fid,
                                    pc,
                                    what: "string index out of range",
                                });
                            }
                        }
                        if let Some(r) = dst {
                            reg(*r)?;
                        }
                    }
                    Instr::ControlPoint { .. } => {}
                }
            }
        }
        Ok(())
    }
}

/// Errors raised by the demo interpreter
#[derive(Debug)]
pub enum VmError {
    UnknownFunction(FuncId),
    BadRegister { func: FuncId, pc: Pc, reg: Reg },
    BadTarget { func: FuncId, pc: Pc, target: Pc },
    BadArity { func: FuncId, expected: usize, got: usize },
    Malformed { func: FuncId, pc: Pc, what: &'static str },
    /// Execution ran off the end of a function.
    PcOutOfRange { func: FuncId, pc: Pc },
    DivisionByZero { func: FuncId, pc: Pc },
    StackOverflow { depth: usize },
    /// A control point refers to a Location the caller did not supply.
    MissingLocation(usize),
    Io(io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::UnknownFunction(func) => write!(f, "Unknown function {}", func),
            VmError::BadRegister { func, pc, reg } => {
                write!(f, "{}@{}: register r{} out of range", func, pc, reg)
            }
            VmError::BadTarget { func, pc, target } => {
                write!(f, "{}@{}: jump target {} out of range", func, pc, target)
            }
            VmError::BadArity { func, expected, got } => {
                write!(f, "{} takes {} arguments, got {}", func, expected, got)
            }
            VmError::Malformed { func, pc, what } => write!(f, "{}@{}: {}", func, pc, what),
            VmError::PcOutOfRange { func, pc } => {
                write!(f, "{}@{}: fell off the end of the function", func, pc)
            }
            VmError::DivisionByZero { func, pc } => write!(f, "{}@{}: division by zero", func, pc),
            VmError::StackOverflow { depth } => write!(f, "Stack overflow at depth {}", depth),
            VmError::MissingLocation(loc) => write!(f, "No Location supplied for control point {}", loc),
            VmError::Io(e) => write!(f, "Output error: {}", e),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for VmError {
    fn from(e: io::Error) -> Self {
        VmError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(nlocals: u32, code: Vec<Instr>) -> Program {
        Program {
            functions: vec![Function {
                name: "main".to_string(),
                nlocals,
                nparams: 0,
                code,
            }],
            strings: vec!["s".to_string()],
            entry: FuncId(0),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let p = single(
            2,
            vec![
                Instr::ControlPoint { loc: 3 },
                Instr::Host {
                    func: HostFn::PrintLabeled,
                    args: vec![Operand::Imm(0), Operand::Reg(1)],
                    dst: None,
                },
                Instr::Return { value: Some(0) },
            ],
        );
        p.validate().unwrap();
        assert_eq!(p.num_locations(), 4);
        assert_eq!(p.find("main"), Some(FuncId(0)));
    }

    #[test]
    fn test_validate_rejects_bad_register_and_target() {
        let p = single(1, vec![Instr::Move { dst: 0, src: 1 }]);
        assert!(matches!(
            p.validate(),
            Err(VmError::BadRegister { reg: 1, .. })
        ));
        let p = single(1, vec![Instr::Jump { target: 5 }]);
        assert!(matches!(p.validate(), Err(VmError::BadTarget { target: 5, .. })));
    }

    #[test]
    fn test_validate_rejects_bad_string() {
        let p = single(
            1,
            vec![Instr::Host {
                func: HostFn::PrintStr,
                args: vec![Operand::Imm(4)],
                dst: None,
            }],
        );
        assert!(matches!(p.validate(), Err(VmError::Malformed { .. })));
    }

    #[test]
    fn test_host_fn_codes() {
        for f in [HostFn::PrintStr, HostFn::PrintInt, HostFn::PrintLabeled] {
            assert_eq!(HostFn::from_u32(f as u32), Some(f));
        }
        assert_eq!(HostFn::from_u32(9), None);
    }
}
