//! Control-point variables
//!
//! The live interpreter values handed to a control point, together with the
//! host-call context compiled traces need for side-effecting calls and the slot
//! through which the runtime tells the interpreter how to continue.
//!
//! The slots are the interpreter frame's locals, borrowed in place: a compiled
//! trace reads and writes them directly, so after a control point returns the
//! frame already holds the post-trace values.

use std::ffi::c_void;
use std::fmt;

use crate::deopt::ResumptionRecord;

/// Machine word used for every interpreter value the runtime sees.
pub type Word = i64;

/// Frame-local register index of the host interpreter.
pub type Reg = u32;

/// Instruction index inside a host function.
pub type Pc = u32;

/// Identity of a host function, as assigned by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Shape of a control-point variables structure: which function's frame it is
/// and how many word-sized slots it carries.
///
/// A trace is only valid for the layout it was recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarLayout {
    pub func: FuncId,
    pub nslots: u32,
}

impl VarLayout {
    pub fn new(func: FuncId, nslots: u32) -> Self {
        VarLayout { func, nslots }
    }
}

impl fmt::Display for VarLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} slots]", self.func, self.nslots)
    }
}

/// Side-effecting operations the host exposes to traced code.
///
/// The interpreter performs these itself while interpreting; compiled traces
/// reach them through the `__metatrace_host_call` runtime symbol.
pub trait HostCalls {
    fn call(&mut self, func: u32, args: &[Word]) -> Word;
}

/// What the interpreter must do once a control point returns.
#[derive(Debug, Default)]
pub enum Continuation {
    /// Carry on with the instruction after the control point.
    #[default]
    Interpret,
    /// A compiled trace ran one full iteration; visit the control point again.
    LoopHeader,
    /// A guard failed; rebuild the frames in the record and resume there.
    Resume(ResumptionRecord),
}

/// The variables live at a control point.
pub struct ControlPointVars<'a> {
    layout: VarLayout,
    slots: &'a mut [Word],
    host: &'a mut dyn HostCalls,
    continuation: Continuation,
}

impl<'a> ControlPointVars<'a> {
    /// Wrap an interpreter frame's locals.
    ///
    /// A slot count that disagrees with `layout` is an interpreter bug and
    /// aborts the process.
    pub fn new(layout: VarLayout, slots: &'a mut [Word], host: &'a mut dyn HostCalls) -> Self {
        if slots.len() != layout.nslots as usize {
            crate::fatal(format_args!(
                "control-point variables for {} passed with {} slots",
                layout,
                slots.len()
            ));
        }
        ControlPointVars {
            layout,
            slots,
            host,
            continuation: Continuation::Interpret,
        }
    }

    pub fn layout(&self) -> VarLayout {
        self.layout
    }

    pub fn slots(&self) -> &[Word] {
        self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Word] {
        self.slots
    }

    pub fn host(&mut self) -> &mut dyn HostCalls {
        &mut *self.host
    }

    /// Raw pointers handed to compiled code: the slot array and a thin pointer
    /// to the `&mut dyn HostCalls` fat pointer.
    pub(crate) fn raw_parts(&mut self) -> (*mut Word, *mut c_void) {
        let slots = self.slots.as_mut_ptr();
        let host = &mut self.host as *mut &'a mut dyn HostCalls as *mut c_void;
        (slots, host)
    }

    pub fn continuation(&self) -> &Continuation {
        &self.continuation
    }

    pub(crate) fn set_continuation(&mut self, continuation: Continuation) {
        self.continuation = continuation;
    }

    /// Take the continuation, leaving `Interpret` behind.
    pub fn take_continuation(&mut self) -> Continuation {
        std::mem::take(&mut self.continuation)
    }

    pub fn into_continuation(self) -> Continuation {
        self.continuation
    }
}

impl fmt::Debug for ControlPointVars<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPointVars")
            .field("layout", &self.layout)
            .field("slots", &self.slots)
            .field("continuation", &self.continuation)
            .finish()
    }
}
