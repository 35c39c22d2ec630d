//! metatrace - Meta-Tracing JIT Runtime
//!
//! This library turns an interpreter into a tracing JIT. The interpreter marks
//! its loop headers as control points; the runtime counts how often each one
//! is reached, records a trace of one loop iteration once it is hot, compiles
//! the trace to native code with Cranelift and runs that code in place of the
//! interpreter. When a compiled trace's assumptions stop holding, it
//! deoptimises back to the interpreter at the exact instruction where they
//! broke.
//!
//! # Architecture
//!
//! 1. **Locations** (`location` module)
//!    - One per control point, with an atomic state machine
//!      `Fresh -> Counting -> Tracing -> Compiling -> Compiled | FailedCompile`
//!
//! 2. **Coordinator** (`mt` module)
//!    - Dispatches control-point visits, owns the single tracing session and
//!      schedules compilation on the rayon pool
//!
//! 3. **Tracer** (`trace` module)
//!    - Records the operations the interpreter reports into a linear trace,
//!      inlining calls and turning branches into guards
//!
//! 4. **Trace compiler** (`jit` module)
//!    - `TraceCompiler` trait and the Cranelift backend
//!
//! 5. **Execution and deoptimisation** (`exec`, `deopt` modules)
//!    - Runs compiled traces and rebuilds interpreter frames on guard failure
//!
//! The `interp` module contains a small register-machine interpreter that
//! drives the runtime; the `metatrace` binary runs its assembly programs.
//!
//! # Example
//!
//! ```rust,no_run
//! use metatrace::interp::{assemble, locations_for, Vm};
//! use metatrace::{MtConfig, MT};
//!
//! let program = assemble(r#"
//!     func main locals 2
//!         const r0, 1000
//!         const r1, 1
//!     loop:
//!         cp 0
//!         sub r0, r0, r1
//!         jnz r0, loop
//!         ret r0
//!     end
//! "#).unwrap();
//!
//! let mt = MT::new(MtConfig::default().with_hot_threshold(10));
//! let locs = locations_for(&mt, &program);
//! let mut vm = Vm::new(&program, Box::new(std::io::stdout())).unwrap();
//! assert_eq!(vm.run(Some(&mt), &locs, &[]).unwrap(), 0);
//! ```
pub mod config;
pub mod ctrlvars;
pub mod deopt;
pub mod diag;
pub mod exec;
pub mod interp;
pub mod jit;
pub mod location;
pub mod mt;
pub mod trace;

pub use config::{ConfigError, IrStage, IrStages, MtConfig};
pub use ctrlvars::{Continuation, ControlPointVars, FuncId, HostCalls, Pc, Reg, VarLayout, Word};
pub use deopt::{FrameState, LayoutMismatch, ResumptionRecord};
pub use diag::{DiagSink, Diagnostics, JitEvent, SharedBuffer};
pub use exec::{ExecOutcome, GuardFailure};
pub use jit::{CompileError, CompiledTrace, CraneliftCompiler, TraceCompiler};
pub use location::{Location, LocationId, LocationState, LocationTag};
pub use mt::{MtBuilder, MtStats, MT};
pub use trace::{Operand, Trace, TraceAbort, TraceEvent};

use std::fmt;

/// Report an internal invariant violation and abort the process.
///
/// Used where continuing would run interpreter or compiled code against state
/// it does not match.
#[cold]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("fatal: {}", args);
    eprintln!("metatrace: fatal: {}", args);
    std::process::abort()
}
