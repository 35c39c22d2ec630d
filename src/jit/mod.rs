//! Trace compilation
//!
//! The runtime only depends on the [`TraceCompiler`] trait; [`CraneliftCompiler`]
//! is the native backend shipped with the crate.
//!
//! # Calling Convention
//!
//! A compiled trace is a C-ABI function
//!
//! ```text
//! fn(vars: *mut Word, deopt: *mut Word, host: *mut c_void) -> u64
//! ```
//!
//! `vars` points at the control-point variables, which the trace reads on entry
//! and updates in place. The return value is `0` when the trace ran to its end
//! and `guard_id + 1` when a guard failed, in which case every trace variable
//! of every active frame has been written to `deopt` and `vars` is untouched.

pub mod codegen;
pub mod runtime;

use std::any::Any;
use std::ffi::c_void;
use std::fmt;

use crate::ctrlvars::{VarLayout, Word};
use crate::diag::Diagnostics;
use crate::location::LocationId;
use crate::trace::{GuardId, GuardSite, Trace, VarIdx};

pub use codegen::CraneliftCompiler;

/// Native entry point of a compiled trace.
pub type TraceEntry = unsafe extern "C" fn(*mut Word, *mut Word, *mut c_void) -> u64;

/// Turns closed traces into executable artifacts.
pub trait TraceCompiler: Send + Sync {
    fn compile(&self, trace: &Trace, diag: &Diagnostics) -> Result<CompiledTrace, CompileError>;
}

/// Errors from trace compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The backend rejected the generated code
    Backend(String),

    /// A trace variable was read before anything defined it
    UndefinedVar(VarIdx),

    /// A guard refers to a site the trace does not carry
    MissingGuardSite(GuardId),

    /// The trace uses something this compiler does not handle
    Unsupported(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Backend(msg) => write!(f, "Backend error: {}", msg),
            CompileError::UndefinedVar(v) => write!(f, "Trace variable v{} used before definition", v),
            CompileError::MissingGuardSite(id) => write!(f, "Guard #{} has no guard site", id),
            CompileError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

/// An executable trace.
///
/// Owns whatever keeps its code alive; the code is released when the last
/// `Arc<CompiledTrace>` drops.
pub struct CompiledTrace {
    name: String,
    loc: LocationId,
    entry: TraceEntry,
    guards: Vec<GuardSite>,
    nvars: u32,
    layout: VarLayout,
    _code: Box<dyn Any + Send + Sync>,
}

impl CompiledTrace {
    /// # Safety
    ///
    /// `entry` must follow the calling convention in the module docs for a
    /// trace with `nvars` variables and the given guard table, and must stay
    /// valid for as long as `code` is alive.
    pub unsafe fn new(
        name: String,
        trace: &Trace,
        entry: TraceEntry,
        code: Box<dyn Any + Send + Sync>,
    ) -> Self {
        CompiledTrace {
            name,
            loc: trace.loc,
            entry,
            guards: trace.guards.clone(),
            nvars: trace.nvars,
            layout: trace.entry,
            _code: code,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The Location this trace was recorded at.
    pub fn loc(&self) -> LocationId {
        self.loc
    }

    pub fn layout(&self) -> VarLayout {
        self.layout
    }

    pub fn nvars(&self) -> u32 {
        self.nvars
    }

    pub fn guards(&self) -> &[GuardSite] {
        &self.guards
    }

    pub fn guard(&self, id: GuardId) -> Option<&GuardSite> {
        self.guards.get(id as usize)
    }

    pub(crate) fn entry(&self) -> TraceEntry {
        self.entry
    }
}

impl fmt::Debug for CompiledTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTrace")
            .field("name", &self.name)
            .field("loc", &self.loc)
            .field("entry", &format!("{:p}", self.entry as *const ()))
            .field("guards", &self.guards.len())
            .field("nvars", &self.nvars)
            .field("layout", &self.layout)
            .finish()
    }
}
