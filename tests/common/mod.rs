//! Shared helpers for the integration tests
//!
//! Programs are written in the demo interpreter's assembly and run either
//! purely interpreted or under a meta-tracer whose diagnostics are captured in
//! a `SharedBuffer`.
#![allow(dead_code)]

use metatrace::diag::{DiagSink, SharedBuffer};
use metatrace::interp::{assemble, locations_for, Program, Vm};
use metatrace::{Location, Word, MT};

pub const JIT_PREFIX: &str = "jit-state: ";

/// Result of one program run.
pub struct Run {
    pub result: Word,
    pub output: String,
}

pub fn program(src: &str) -> Program {
    assemble(src).expect("test program should assemble")
}

/// Run `src` with control points disabled.
pub fn interpret(src: &str, args: &[Word]) -> Run {
    let program = program(src);
    let out = SharedBuffer::new();
    let mut vm = Vm::new(&program, Box::new(out.clone())).expect("valid program");
    let result = vm.run(None, &[], args).expect("interpretation should succeed");
    Run {
        result,
        output: out.contents(),
    }
}

/// A synchronously compiling meta-tracer printing jit-state events to `sink`.
pub fn sync_mt(threshold: u32, sink: &SharedBuffer) -> MT {
    MT::builder()
        .hot_threshold(threshold)
        .synchronous_compile(true)
        .print_jitstate(true)
        .diag_sink(DiagSink::Buffer(sink.clone()))
        .build()
}

/// Run `program` under `mt`, writing program output to `out`.
pub fn run_traced(mt: &MT, program: &Program, locs: &[Location], out: &SharedBuffer, args: &[Word]) -> Word {
    let mut vm = Vm::new(program, Box::new(out.clone())).expect("valid program");
    vm.run(Some(mt), locs, args).expect("traced run should succeed")
}

/// Run `src` under a synchronous meta-tracer with program output and
/// diagnostics interleaved in one buffer.
pub fn run_interleaved(src: &str, threshold: u32) -> (Run, Vec<String>) {
    let program = program(src);
    let buf = SharedBuffer::new();
    let mt = sync_mt(threshold, &buf);
    let locs = locations_for(&mt, &program);
    let result = run_traced(&mt, &program, &locs, &buf, &[]);
    let lines = buf.lines();
    let output = lines
        .iter()
        .filter(|l| !l.starts_with(JIT_PREFIX))
        .map(|l| format!("{}\n", l))
        .collect();
    (Run { result, output }, lines)
}

/// The jit-state events among `lines`, prefix stripped.
pub fn events(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix(JIT_PREFIX))
        .collect()
}

pub fn count(lines: &[String], event: &str) -> usize {
    events(lines).iter().filter(|e| **e == event).count()
}
