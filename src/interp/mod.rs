//! Demo host interpreter
//!
//! A small register machine used by the CLI, the integration tests and the
//! benches to drive the meta-tracer. It visits control points, reports every
//! operation it executes while a trace is being recorded, and rebuilds its
//! frames from resumption records after a guard failure.

pub mod asm;
pub mod program;

use std::io::{self, Write};

use tracing::trace;

use crate::ctrlvars::{Continuation, ControlPointVars, FuncId, HostCalls, Pc, Reg, VarLayout, Word};
use crate::deopt::ResumptionRecord;
use crate::location::Location;
use crate::mt::MT;
use crate::trace::{copy_bytes, Operand, TraceEvent};

pub use asm::{assemble, AsmError};
pub use program::{Function, HostFn, Instr, Program, VmError};

/// Deepest call stack the interpreter allows.
pub const MAX_FRAMES: usize = 10_000;

/// The interpreter's side of host calls: program output.
pub struct HostEnv {
    strings: Vec<String>,
    out: Box<dyn Write + Send>,
    error: Option<io::Error>,
}

impl HostEnv {
    pub fn new(strings: Vec<String>, out: Box<dyn Write + Send>) -> Self {
        HostEnv {
            strings,
            out,
            error: None,
        }
    }

    fn string(&self, idx: Word) -> &str {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.strings.get(i))
            .map_or("", String::as_str)
    }

    fn print(&mut self, func: HostFn, args: &[Word]) -> io::Result<()> {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        match func {
            HostFn::PrintStr => {
                let s = self.string(arg(0)).to_owned();
                writeln!(self.out, "{}", s)
            }
            HostFn::PrintInt => writeln!(self.out, "{}", arg(0)),
            HostFn::PrintLabeled => {
                let label = self.string(arg(0)).to_owned();
                writeln!(self.out, "{}={}", label, arg(1))
            }
        }
    }

    /// The first output error since the last call, if any.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl HostCalls for HostEnv {
    fn call(&mut self, func: u32, args: &[Word]) -> Word {
        let Some(func) = HostFn::from_u32(func) else {
            crate::fatal(format_args!("unknown host function {}", func));
        };
        if let Err(e) = self.print(func, args) {
            self.error.get_or_insert(e);
        }
        0
    }
}

#[derive(Debug, Clone)]
struct Frame {
    func: FuncId,
    pc: Pc,
    locals: Vec<Word>,
    ret: Option<Reg>,
}

/// Create one Location per control point of `program`.
pub fn locations_for(mt: &MT, program: &Program) -> Vec<Location> {
    (0..program.num_locations())
        .map(|_| mt.location_new())
        .collect()
}

/// Interpreter for one thread.
pub struct Vm<'p> {
    program: &'p Program,
    host: HostEnv,
    frames: Vec<Frame>,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program, out: Box<dyn Write + Send>) -> Result<Self, VmError> {
        program.validate()?;
        Ok(Vm {
            program,
            host: HostEnv::new(program.strings.clone(), out),
            frames: Vec::new(),
        })
    }

    /// Run the entry function with `args` until it returns.
    ///
    /// Without `mt` control points are no-ops. `locs[i]` is the Location of
    /// control point `i`.
    pub fn run(&mut self, mt: Option<&MT>, locs: &[Location], args: &[Word]) -> Result<Word, VmError> {
        let entry = self.program.entry;
        self.frames.clear();
        self.frames.push(self.new_frame(entry, args, None)?);

        loop {
            match self.step(mt, locs) {
                Ok(Some(value)) => {
                    self.flush()?;
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => {
                    // A recording cannot outlive the run that fed it.
                    if let Some(mt) = mt {
                        mt.abort_tracing();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn flush(&mut self) -> Result<(), VmError> {
        if let Some(e) = self.host.take_error() {
            return Err(VmError::Io(e));
        }
        self.host.out.flush()?;
        Ok(())
    }

    fn new_frame(&self, func: FuncId, args: &[Word], ret: Option<Reg>) -> Result<Frame, VmError> {
        let f = self
            .program
            .function(func)
            .ok_or(VmError::UnknownFunction(func))?;
        if args.len() != f.nparams as usize {
            return Err(VmError::BadArity {
                func,
                expected: f.nparams as usize,
                got: args.len(),
            });
        }
        let mut locals = vec![0; f.nlocals as usize];
        locals[..args.len()].copy_from_slice(args);
        Ok(Frame {
            func,
            pc: 0,
            locals,
            ret,
        })
    }

    /// Execute one instruction; `Some` once the entry function returned.
    fn step(&mut self, mt: Option<&MT>, locs: &[Location]) -> Result<Option<Word>, VmError> {
        let program = self.program;
        let recording = mt.filter(|mt| mt.is_tracing());
        let depth = self.frames.len();
        let Some(frame) = self.frames.last_mut() else {
            return Err(VmError::StackOverflow { depth: 0 });
        };
        let func = frame.func;
        let pc = frame.pc;
        let instr = program
            .function(func)
            .and_then(|f| f.code.get(pc as usize))
            .ok_or(VmError::PcOutOfRange { func, pc })?;

        // Registers were checked by `Program::validate`.
        match instr {
            Instr::Const { dst, value } => {
                record(recording, TraceEvent::Const { dst: *dst, value: *value });
                frame.locals[*dst as usize] = *value;
                frame.pc += 1;
            }
            Instr::Move { dst, src } => {
                record(recording, TraceEvent::Move { dst: *dst, src: *src });
                frame.locals[*dst as usize] = frame.locals[*src as usize];
                frame.pc += 1;
            }
            Instr::BinOp { kind, dst, lhs, rhs } => {
                record(
                    recording,
                    TraceEvent::BinOp {
                        kind: *kind,
                        dst: *dst,
                        lhs: *lhs,
                        rhs: *rhs,
                    },
                );
                let v = kind.eval(frame.locals[*lhs as usize], frame.locals[*rhs as usize]);
                frame.locals[*dst as usize] = v;
                frame.pc += 1;
            }
            Instr::Div { dst, lhs, rhs } => {
                record(recording, TraceEvent::Unsupported { what: "div" });
                let d = frame.locals[*rhs as usize];
                if d == 0 {
                    return Err(VmError::DivisionByZero { func, pc });
                }
                frame.locals[*dst as usize] = frame.locals[*lhs as usize].wrapping_div(d);
                frame.pc += 1;
            }
            Instr::CopyBytes { dst, src, len } => {
                record(
                    recording,
                    TraceEvent::CopyBytes {
                        dst: *dst,
                        src: *src,
                        len: *len,
                    },
                );
                let v = copy_bytes(frame.locals[*dst as usize], frame.locals[*src as usize], *len);
                frame.locals[*dst as usize] = v;
                frame.pc += 1;
            }
            Instr::Jump { target } => frame.pc = *target,
            Instr::Branch {
                cond,
                target,
                when_nonzero,
            } => {
                let nonzero = frame.locals[*cond as usize] != 0;
                record(
                    recording,
                    TraceEvent::Branch {
                        pc,
                        cond: *cond,
                        nonzero,
                    },
                );
                frame.pc = if nonzero == *when_nonzero { *target } else { pc + 1 };
            }
            Instr::Switch {
                discr,
                values,
                targets,
                default,
            } => {
                let value = frame.locals[*discr as usize];
                let arm = values.iter().position(|v| *v == value);
                record(
                    recording,
                    TraceEvent::Switch {
                        pc,
                        discr: *discr,
                        value,
                        cases: values,
                        arm,
                    },
                );
                frame.pc = arm.map_or(*default, |i| targets[i]);
            }
            Instr::Call { func: callee, args, ret } => {
                if depth >= MAX_FRAMES {
                    return Err(VmError::StackOverflow { depth });
                }
                let nlocals = program.function(*callee).map_or(0, |f| f.nlocals);
                record(
                    recording,
                    TraceEvent::Call {
                        pc,
                        callee: *callee,
                        nlocals,
                        args,
                        ret: *ret,
                    },
                );
                let values: Vec<Word> = args.iter().map(|r| frame.locals[*r as usize]).collect();
                frame.pc += 1;
                let callee_frame = self.new_frame(*callee, &values, *ret)?;
                self.frames.push(callee_frame);
            }
            Instr::Return { value } => {
                record(recording, TraceEvent::Return { value: *value });
                let v = value.map_or(0, |r| frame.locals[r as usize]);
                let ret = frame.ret;
                self.frames.pop();
                match self.frames.last_mut() {
                    None => return Ok(Some(v)),
                    Some(caller) => {
                        if let Some(r) = ret {
                            caller.locals[r as usize] = v;
                        }
                    }
                }
            }
            Instr::Host { func: host_fn, args, dst } => {
                record(
                    recording,
                    TraceEvent::HostCall {
                        func: *host_fn as u32,
                        args,
                        dst: *dst,
                    },
                );
                let values: smallvec::SmallVec<[Word; 4]> = args
                    .iter()
                    .map(|a| match *a {
                        Operand::Reg(r) => frame.locals[r as usize],
                        Operand::Imm(v) => v,
                    })
                    .collect();
                let r = self.host.call(*host_fn as u32, &values);
                let frame = self
                    .frames
                    .last_mut()
                    .ok_or(VmError::StackOverflow { depth: 0 })?;
                if let Some(dst) = dst {
                    frame.locals[*dst as usize] = r;
                }
                frame.pc += 1;
            }
            Instr::ControlPoint { loc } => {
                let Some(mt) = mt else {
                    frame.pc += 1;
                    return Ok(None);
                };
                let location = locs.get(*loc).ok_or(VmError::MissingLocation(*loc))?;
                let layout = VarLayout::new(func, frame.locals.len() as u32);
                let continuation = {
                    let mut vars = ControlPointVars::new(layout, &mut frame.locals, &mut self.host);
                    mt.control_point(location, &mut vars);
                    vars.into_continuation()
                };
                match continuation {
                    Continuation::Interpret => frame.pc += 1,
                    Continuation::LoopHeader => {}
                    Continuation::Resume(record) => self.resume(record),
                }
            }
        }
        Ok(None)
    }

    /// Rebuild the interpreter frames described by `record`.
    ///
    /// The outermost frame replaces the current top frame; inlined frames are
    /// pushed on top of it. A record that does not fit the program aborts the
    /// process.
    pub fn resume(&mut self, record: ResumptionRecord) {
        trace!(guard = record.guard, frames = record.frames.len(), "resume");
        let mut frames = record.frames.into_iter();
        let Some(outer) = frames.next() else {
            crate::fatal(format_args!("resumption record without frames"));
        };
        let Some(top) = self.frames.last_mut() else {
            crate::fatal(format_args!("resumption with an empty call stack"));
        };
        if top.func != outer.func || top.locals.len() != outer.locals.len() {
            crate::fatal(format_args!(
                "resumption frame {}[{} locals] does not match interpreter frame {}[{} locals]",
                outer.func,
                outer.locals.len(),
                top.func,
                top.locals.len()
            ));
        }
        top.pc = outer.pc;
        top.locals = outer.locals;

        for state in frames {
            let nlocals = match self.program.function(state.func) {
                Some(f) => f.nlocals as usize,
                None => crate::fatal(format_args!("resumption into unknown function {}", state.func)),
            };
            if state.locals.len() != nlocals {
                crate::fatal(format_args!(
                    "resumption frame {} has {} locals, function has {}",
                    state.func,
                    state.locals.len(),
                    nlocals
                ));
            }
            self.frames.push(Frame {
                func: state.func,
                pc: state.pc,
                locals: state.locals,
                ret: state.ret,
            });
        }
    }
}

fn record(mt: Option<&MT>, event: TraceEvent<'_>) {
    if let Some(mt) = mt {
        mt.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::SharedBuffer;

    fn run_plain(src: &str) -> (Word, String) {
        let program = assemble(src).unwrap();
        let out = SharedBuffer::new();
        let mut vm = Vm::new(&program, Box::new(out.clone())).unwrap();
        let r = vm.run(None, &[], &[]).unwrap();
        (r, out.contents())
    }

    #[test]
    fn test_loop_without_tracer() {
        let (r, out) = run_plain(
            r#"
            func main locals 2
                const r0, 3
                const r1, 1
            loop:
                cp 0
                printkv "i", r0
                sub r0, r0, r1
                jnz r0, loop
                ret r0
            end
            "#,
        );
        assert_eq!(r, 0);
        assert_eq!(out, "i=3\ni=2\ni=1\n");
    }

    #[test]
    fn test_calls_and_switch() {
        let (r, out) = run_plain(
            r#"
            func twice locals 1 params 1
                add r0, r0, r0
                ret r0
            end
            func main locals 2
                const r0, 200
                switch r0, 100 => a, 200 => b, _ => c
            a:
                print "a"
                jmp c
            b:
                call twice(r0) -> r1
                printi r1
            c:
                ret r1
            end
            "#,
        );
        assert_eq!(r, 400);
        assert_eq!(out, "400\n");
    }

    #[test]
    fn test_division_by_zero() {
        let program = assemble(
            "func main locals 2\n  div r0, r0, r1\n  ret r0\nend\n",
        )
        .unwrap();
        let mut vm = Vm::new(&program, Box::new(io::sink())).unwrap();
        assert!(matches!(
            vm.run(None, &[], &[]),
            Err(VmError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_entry_arguments() {
        let program = assemble("func main locals 2 params 1\n  ret r0\nend\n").unwrap();
        let mut vm = Vm::new(&program, Box::new(io::sink())).unwrap();
        assert_eq!(vm.run(None, &[], &[42]).unwrap(), 42);
        assert!(matches!(
            vm.run(None, &[], &[]),
            Err(VmError::BadArity { .. })
        ));
    }

    #[test]
    fn test_missing_location() {
        let program = assemble("func main locals 1\n  cp 0\n  ret\nend\n").unwrap();
        let mt = MT::builder().build();
        let mut vm = Vm::new(&program, Box::new(io::sink())).unwrap();
        assert!(matches!(
            vm.run(Some(&mt), &[], &[]),
            Err(VmError::MissingLocation(0))
        ));
        let locs = locations_for(&mt, &program);
        assert_eq!(locs.len(), 1);
        assert_eq!(vm.run(Some(&mt), &locs, &[]).unwrap(), 0);
    }
}
