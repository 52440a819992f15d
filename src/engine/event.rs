use std::sync::Arc;

use super::{Module, Program, ThreadRef};

/// Severity carried by message-box style engine messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    None,
    Warning,
    Error,
}

/// Classification of an engine message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Modal-dialog style message. During a launch the first error/warning
    /// of this class is captured as the launch failure reason.
    MessageBox { severity: MessageSeverity },
    /// Exception description text.
    Exception,
    /// Plain status text. May be reclassified as error output by prefix.
    Status,
}

/// The closed set of notifications a debug engine delivers to the session.
///
/// The engine calls back on its own thread(s); every event carries an
/// [`EventAck`] that re-arms the engine's synchronous continuation gate.
pub enum EngineEvent {
    /// The engine object finished initializing.
    EngineCreated,
    /// The debuggee program exists. The only asynchronous event kind: the
    /// acknowledgment is deferred until the client finishes configuration.
    ProgramCreated { program: Arc<dyn Program> },
    /// The debuggee is gone, either by exit or detach.
    ProgramDestroyed { exit_code: i64 },
    /// A step operation finished.
    StepComplete { thread: Arc<dyn ThreadRef> },
    /// The debuggee reached its entry point.
    EntryPoint { thread: Arc<dyn ThreadRef> },
    /// One or more bound breakpoints were hit.
    BreakpointHit {
        thread: Arc<dyn ThreadRef>,
        breakpoint_ids: Vec<u32>,
    },
    /// An asynchronous break (pause request) completed.
    AsyncBreak { thread: Arc<dyn ThreadRef> },
    /// The debuggee stopped on an exception.
    Exception {
        thread: Arc<dyn ThreadRef>,
        description: String,
    },
    ThreadCreated { thread: Arc<dyn ThreadRef> },
    ThreadExited { thread: Arc<dyn ThreadRef> },
    ModuleLoaded { module: Arc<dyn Module> },
    ModuleUnloaded { module: Arc<dyn Module> },
    /// A pending breakpoint resolved to a concrete location. `line` is the
    /// engine's authoritative bound line, preferred over the requested one.
    BreakpointBound {
        breakpoint_id: u32,
        line: Option<u32>,
    },
    /// A pending breakpoint failed to bind.
    BreakpointError {
        breakpoint_id: u32,
        message: String,
    },
    /// Debuggee output captured by the engine.
    Output { text: String },
    /// Engine diagnostic message.
    Message { class: MessageClass, text: String },
}

impl EngineEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::EngineCreated => "engine-created",
            EngineEvent::ProgramCreated { .. } => "program-created",
            EngineEvent::ProgramDestroyed { .. } => "program-destroyed",
            EngineEvent::StepComplete { .. } => "step-complete",
            EngineEvent::EntryPoint { .. } => "entry-point",
            EngineEvent::BreakpointHit { .. } => "breakpoint-hit",
            EngineEvent::AsyncBreak { .. } => "async-break",
            EngineEvent::Exception { .. } => "exception",
            EngineEvent::ThreadCreated { .. } => "thread-created",
            EngineEvent::ThreadExited { .. } => "thread-exited",
            EngineEvent::ModuleLoaded { .. } => "module-loaded",
            EngineEvent::ModuleUnloaded { .. } => "module-unloaded",
            EngineEvent::BreakpointBound { .. } => "breakpoint-bound",
            EngineEvent::BreakpointError { .. } => "breakpoint-error",
            EngineEvent::Output { .. } => "output",
            EngineEvent::Message { .. } => "message",
        }
    }
}

/// Continuation gate for one delivered event. The engine delivers no
/// further events until this is completed; completing on drop keeps an
/// early-returning handler from stalling event delivery.
pub struct EventAck {
    complete: Option<Box<dyn FnOnce() + Send>>,
}

impl EventAck {
    pub fn new(complete: impl FnOnce() + Send + 'static) -> Self {
        EventAck {
            complete: Some(Box::new(complete)),
        }
    }

    /// An ack that does nothing, for engines without a continuation gate.
    pub fn noop() -> Self {
        EventAck { complete: None }
    }

    pub fn complete(mut self) {
        if let Some(complete) = self.complete.take() {
            complete();
        }
    }
}

impl Drop for EventAck {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            complete();
        }
    }
}

/// Receiver half of the engine callback channel. Implemented by the
/// session; installed at launch time.
pub trait EngineEventSink: Send + Sync {
    fn event(&self, event: EngineEvent, ack: EventAck);
}
