//! JIT Runtime Support Functions
//!
//! Helpers compiled traces call back into. They use the C ABI and take raw
//! pointers; the generated code passes through the pointers it was entered
//! with.

use std::ffi::c_void;

use crate::ctrlvars::{HostCalls, Word};

/// Symbol under which [`metatrace_host_call`] is registered with each JIT module.
pub const HOST_CALL_SYMBOL: &str = "__metatrace_host_call";

/// Perform a host call on behalf of a compiled trace.
///
/// # Safety
/// `host` must point at a live `&mut dyn HostCalls` (the fat reference itself,
/// not the object), and `args` at `nargs` readable words.
pub unsafe extern "C" fn metatrace_host_call(
    host: *mut c_void,
    func: i64,
    args: *const Word,
    nargs: i64,
) -> Word {
    let host = &mut *(host as *mut &mut dyn HostCalls);
    let args = if nargs <= 0 || args.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(args, nargs as usize)
    };
    host.call(func as u32, args)
}
