//! Diagnostic stream
//!
//! Lifecycle events and IR dumps are written as text lines to a diagnostic
//! sink, separate from `tracing` logs. The event vocabulary is fixed so that
//! tests can compare runs line by line:
//!
//! ```text
//! jit-state: start-tracing
//! jit-state: stop-tracing
//! --- Begin pre-trace-ir ---
//! ...
//! --- End pre-trace-ir ---
//! jit-state: enter-jit-code
//! jit-state: exit-jit-code
//! ```

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::{IrStage, IrStages};

/// Lifecycle events emitted when `print_jitstate` is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JitEvent {
    StartTracing,
    StopTracing,
    EnterJitCode,
    Deoptimise,
    ExitJitCode,
    /// A guard failed inside an inlined frame: more than one interpreter frame
    /// has to be rebuilt.
    Stopgap,
}

impl JitEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JitEvent::StartTracing => "start-tracing",
            JitEvent::StopTracing => "stop-tracing",
            JitEvent::EnterJitCode => "enter-jit-code",
            JitEvent::Deoptimise => "deoptimise",
            JitEvent::ExitJitCode => "exit-jit-code",
            JitEvent::Stopgap => "stopgap",
        }
    }
}

/// Prefix of every event line.
pub const JITSTATE_PREFIX: &str = "jit-state: ";

/// In-memory byte buffer that can be shared between the diagnostic stream and
/// a host's own output, so that the two interleave in causal order.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }

    /// Event names in emission order, prefix stripped.
    pub fn jit_events(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter_map(|l| l.strip_prefix(JITSTATE_PREFIX))
            .map(str::to_owned)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where diagnostic lines go.
#[derive(Debug, Clone, Default)]
pub enum DiagSink {
    #[default]
    Stderr,
    Buffer(SharedBuffer),
}

impl DiagSink {
    fn write_block(&self, text: &str) {
        let result = match self {
            DiagSink::Stderr => {
                let stderr = io::stderr();
                let mut lock = stderr.lock();
                lock.write_all(text.as_bytes()).and_then(|_| lock.flush())
            }
            DiagSink::Buffer(buf) => buf.clone().write_all(text.as_bytes()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to write diagnostic output");
        }
    }
}

/// The diagnostic stream of one coordinator.
#[derive(Debug)]
pub struct Diagnostics {
    print_jitstate: bool,
    print_ir: IrStages,
    sink: DiagSink,
    // Serialises multi-line dumps against events from other threads.
    lock: Mutex<()>,
}

impl Diagnostics {
    pub fn new(print_jitstate: bool, print_ir: IrStages, sink: DiagSink) -> Self {
        Diagnostics {
            print_jitstate,
            print_ir,
            sink,
            lock: Mutex::new(()),
        }
    }

    /// A stream that prints nothing.
    pub fn silent() -> Self {
        Self::new(false, IrStages::none(), DiagSink::Stderr)
    }

    pub fn prints_jitstate(&self) -> bool {
        self.print_jitstate
    }

    pub fn wants_ir(&self, stage: IrStage) -> bool {
        self.print_ir.contains(stage)
    }

    pub fn event(&self, event: JitEvent) {
        if !self.print_jitstate {
            return;
        }
        let _guard = self.lock.lock();
        self.sink
            .write_block(&format!("{}{}\n", JITSTATE_PREFIX, event.as_str()));
    }

    /// Print `ir` bracketed by the stage markers, if the stage is enabled.
    pub fn dump_ir(&self, stage: IrStage, ir: &str) {
        if !self.wants_ir(stage) {
            return;
        }
        let mut text = String::with_capacity(ir.len() + 64);
        text.push_str(&format!("--- Begin {} ---\n", stage.name()));
        text.push_str(ir);
        if !ir.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("--- End {} ---\n", stage.name()));
        let _guard = self.lock.lock();
        self.sink.write_block(&text);
    }
}
