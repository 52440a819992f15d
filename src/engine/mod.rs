//! The engine-facing API: the opaque native debugger backend is reachable
//! only through these traits. Object handles (processes, programs, threads,
//! frames, properties, modules, code contexts) are reference-counted trait
//! objects owned by the engine; the session never looks inside them.
//!
//! Optional functionality (memory reads, disassembly, completions, data
//! breakpoints, goto targets) is exposed through capability accessors that
//! return `None` when the backend does not support it.

pub mod error;
pub mod event;

pub use error::{describe_code, EngineFault, EngineResult, Severity};
pub use event::{EngineEvent, EngineEventSink, EventAck, MessageClass, MessageSeverity};

use std::str::FromStr;
use std::sync::Arc;

/// Which property set a scope expansion asks the engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableCategory {
    /// Locals plus arguments.
    Locals,
    /// CPU registers.
    Registers,
}

/// Options threaded through every property/evaluation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyQuery {
    pub radix: u32,
    pub timeout_ms: u32,
    /// Forbid function evaluation side effects (hover context).
    pub no_side_effects: bool,
    /// Suppress non-public members ("just my code").
    pub public_members_only: bool,
}

impl PropertyQuery {
    pub fn new(radix: u32, timeout_ms: u32) -> Self {
        PropertyQuery {
            radix,
            timeout_ms,
            no_side_effects: false,
            public_members_only: false,
        }
    }
}

/// Snapshot of one debug property, produced under a [`PropertyQuery`].
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub value: String,
    pub type_name: Option<String>,
    /// Full expression that re-evaluates to this property.
    pub full_name: Option<String>,
    pub expandable: bool,
    pub read_only: bool,
    /// The value is an error result (failed evaluation rendered as text).
    pub error_value: bool,
    pub memory_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub path: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StepGranularity {
    #[default]
    Statement,
    Line,
    Instruction,
}

impl StepGranularity {
    /// Parse the client's granularity string, defaulting to statement.
    pub fn parse(value: Option<&str>) -> Self {
        value
            .and_then(|v| StepGranularity::from_str(v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccessKind {
    Read,
    Write,
    ReadWrite,
}

/// Where a requested breakpoint should bind.
#[derive(Debug, Clone)]
pub enum BreakpointLocation {
    Source { path: String, line: u32 },
    Function { name: String },
    Address { memory_reference: String },
    Data { data_id: String, access: DataAccessKind },
}

/// A create-pending-breakpoint request handed to the engine. `id` is the
/// stable client-visible breakpoint id; bound/error events refer back to it.
#[derive(Debug, Clone)]
pub struct BreakpointSpec {
    pub id: u32,
    pub location: BreakpointLocation,
    pub condition: Option<String>,
}

/// One exception filter the engine advertises to the client.
#[derive(Debug, Clone)]
pub struct ExceptionFilterDesc {
    pub filter: String,
    pub label: String,
    pub supports_condition: bool,
    pub default_enabled: bool,
}

/// An exception filter selection to apply.
#[derive(Debug, Clone)]
pub struct ExceptionSetting {
    pub filter: String,
    pub condition: Option<String>,
}

/// What to launch or attach to. Transport-specific plumbing (pipe programs,
/// server addresses) is opaque to the session and forwarded as-is.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub attach_pid: Option<i64>,
    pub no_debug: bool,
    pub stop_at_entry: bool,
    pub remote_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryChunk {
    pub address: String,
    pub data: Vec<u8>,
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
pub struct DisassembledInstruction {
    pub address: String,
    pub instruction: String,
    pub bytes: Option<String>,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub label: String,
    pub text: Option<String>,
    pub start: Option<u32>,
    pub length: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DataBreakpointDescriptor {
    /// `None` when the property is not watchable.
    pub data_id: Option<String>,
    pub description: String,
    pub access_kinds: Vec<DataAccessKind>,
}

/// The debugger backend.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Start (or attach to) the debuggee in a suspended state. `sink`
    /// becomes the target of all future engine events.
    fn launch_suspended(
        &self,
        spec: &LaunchSpec,
        sink: Arc<dyn EngineEventSink>,
    ) -> EngineResult<Arc<dyn Process>>;

    /// Let a suspended launch proceed.
    fn resume(&self, process: &dyn Process) -> EngineResult<()>;

    /// Kill the debuggee.
    fn terminate(&self, process: &dyn Process) -> EngineResult<()>;

    fn create_breakpoint(&self, spec: &BreakpointSpec) -> EngineResult<Arc<dyn PendingBreakpoint>>;

    fn set_exceptions(&self, settings: &[ExceptionSetting]) -> EngineResult<()>;

    fn exception_filters(&self) -> Vec<ExceptionFilterDesc> {
        Vec::new()
    }

    fn supports_conditional_breakpoints(&self) -> bool {
        false
    }

    fn supports_function_breakpoints(&self) -> bool {
        false
    }

    /// Push a named configuration setting down to the engine.
    fn set_metric(&self, name: &str, value: &str);

    fn pointer_size(&self) -> Option<u32> {
        None
    }

    // Optional capabilities.

    fn as_memory_access(&self) -> Option<&dyn MemoryAccess> {
        None
    }

    fn as_disassembly(&self) -> Option<&dyn Disassembly> {
        None
    }

    fn as_completions(&self) -> Option<&dyn Completions> {
        None
    }

    fn as_data_breakpoints(&self) -> Option<&dyn DataBreakpoints> {
        None
    }

    fn as_goto_targets(&self) -> Option<&dyn GotoTargets> {
        None
    }
}

/// The launched (or attached) OS process.
pub trait Process: Send + Sync {
    fn id(&self) -> Option<u32>;
    fn name(&self) -> String;
}

/// The debuggee program, delivered by the program-created event.
pub trait Program: Send + Sync {
    /// Resume execution. `thread` picks the thread to prioritize; `None`
    /// resumes all.
    fn continue_run(&self, thread: Option<&dyn ThreadRef>) -> EngineResult<()>;

    fn step(
        &self,
        thread: &dyn ThreadRef,
        kind: StepKind,
        granularity: StepGranularity,
    ) -> EngineResult<()>;

    /// Interrupt the running debuggee. Completion arrives as an
    /// async-break event.
    fn cause_break(&self) -> EngineResult<()>;

    fn detach(&self) -> EngineResult<()>;
}

pub trait ThreadRef: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> String;
    fn frames(&self, radix: u32) -> EngineResult<Vec<Arc<dyn StackFrame>>>;
}

pub trait StackFrame: Send + Sync {
    fn name(&self) -> String;
    fn location(&self) -> Option<SourceLocation>;
    fn instruction_pointer(&self) -> Option<String>;

    fn properties(
        &self,
        category: VariableCategory,
        query: PropertyQuery,
    ) -> EngineResult<Vec<Arc<dyn Property>>>;

    /// Parse an expression in this frame's context. Parse failures carry
    /// the engine's diagnostic text.
    fn parse_expression(&self, expression: &str) -> EngineResult<Arc<dyn Expression>>;
}

pub trait Expression: Send + Sync {
    fn evaluate(&self, query: PropertyQuery) -> EngineResult<Arc<dyn Property>>;
}

pub trait Property: Send + Sync {
    fn info(&self, query: PropertyQuery) -> EngineResult<PropertyInfo>;
    fn children(&self, query: PropertyQuery) -> EngineResult<Vec<Arc<dyn Property>>>;
    /// Assign from a string rendering. Engine diagnostic text, when
    /// present, is surfaced to the client verbatim.
    fn set_value(&self, value: &str, query: PropertyQuery) -> EngineResult<()>;
}

pub trait Module: Send + Sync {
    fn name(&self) -> String;
    fn path(&self) -> Option<String>;
    fn version(&self) -> Option<String>;
    fn symbols_loaded(&self) -> bool;
    fn load_address(&self) -> Option<u64>;
    fn size(&self) -> Option<u64>;
}

/// Engine-side handle for a requested breakpoint, before and after it
/// resolves to a concrete location.
pub trait PendingBreakpoint: Send + Sync {
    fn bind(&self) -> EngineResult<()>;
    /// Release the breakpoint and any engine-side resources backing it.
    fn delete(&self) -> EngineResult<()>;
}

/// An executable code location, used for goto targets.
pub trait CodeContext: Send + Sync {
    fn memory_reference(&self) -> String;
    fn location(&self) -> Option<SourceLocation>;
}

pub trait MemoryAccess: Send + Sync {
    fn read_memory(
        &self,
        memory_reference: &str,
        offset: i64,
        count: usize,
    ) -> EngineResult<MemoryChunk>;
}

pub trait Disassembly: Send + Sync {
    fn disassemble(
        &self,
        memory_reference: &str,
        byte_offset: i64,
        instruction_offset: i64,
        instruction_count: usize,
    ) -> EngineResult<Vec<DisassembledInstruction>>;
}

pub trait Completions: Send + Sync {
    fn completions(
        &self,
        frame: Option<&dyn StackFrame>,
        text: &str,
        column: u32,
    ) -> EngineResult<Vec<Completion>>;
}

pub trait DataBreakpoints: Send + Sync {
    fn data_breakpoint_info(&self, property: &dyn Property) -> EngineResult<DataBreakpointDescriptor>;
}

pub trait GotoTargets: Send + Sync {
    fn code_contexts(&self, path: &str, line: u32) -> EngineResult<Vec<Arc<dyn CodeContext>>>;
}
