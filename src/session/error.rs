use crate::engine::EngineFault;

/// Per-request failure taxonomy. Every variant maps to a stable numeric
/// identifier attached to the failure response; none of them tears down
/// the session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- configuration errors --------------------------------------
    #[error("{0}: property '{1}' is missing or empty")]
    MissingProperty(&'static str, &'static str),
    #[error("launch: the launch configuration must be completed: change 'program' to the path of the executable to debug")]
    ProgramPlaceholder,
    #[error("program '{0}' does not exist")]
    ProgramNotFound(String),
    #[error("launch: working directory '{0}' does not exist")]
    WorkingDirectoryNotFound(String),
    #[error("launch: 'processId' must not be specified, use an attach request instead")]
    ProcessIdOnLaunch,
    #[error("attach: unable to parse the process id")]
    InvalidProcessId,
    #[error("attach: the attach configuration must be completed: change 'processId' to the process to attach to")]
    ProcessIdPlaceholder,
    #[error("attach: 'debuggerPath' is required for a pipe transport")]
    MissingDebuggerPath,
    #[error("no debug engine is registered for adapter id '{0}'")]
    EngineNotFound(String),
    #[error("a launch or attach is already in progress")]
    ConcurrentLaunch,
    #[error("the session has no loaded debug engine")]
    NotInitialized,

    // --------------------------------- target state errors ---------------------------------------
    #[error("the debuggee is not stopped")]
    TargetNotStopped,
    #[error("no debuggee is being debugged")]
    NoProgram,

    // --------------------------------- entity not found ------------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("cannot evaluate expression on the specified stack frame")]
    FrameNotFound(i32),
    #[error("variable '{0}' not found")]
    VariableNotFound(String),
    #[error("variable '{0}' is read-only")]
    VariableReadOnly(String),
    #[error("unable to set variable: {0}")]
    SetVariableFailed(String),
    #[error("goto target {0} not found")]
    GotoTargetNotFound(i32),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),

    // --------------------------------- evaluation ------------------------------------------------
    #[error("unable to parse expression: {0}")]
    ExpressionParse(String),
    #[error("evaluation error")]
    HoverEvaluation,

    // --------------------------------- unsupported operations ------------------------------------
    #[error("goto is not supported")]
    GotoNotSupported,
    #[error("{0} is not supported by the loaded debug engine")]
    CapabilityNotSupported(&'static str),

    // --------------------------------- launch/engine failures ------------------------------------
    /// Launch failure text captured from an engine message event, surfaced
    /// in preference to a translated failure code.
    #[error("{0}")]
    LaunchMessage(String),
    #[error("{scenario}: {fault}")]
    Engine {
        scenario: &'static str,
        fault: EngineFault,
    },
}

impl Error {
    /// Wrap an engine fault with its scenario text. Corrupting-class
    /// faults are reported in full to the telemetry sink before being
    /// surfaced as an ordinary request failure.
    pub fn engine(scenario: &'static str, fault: EngineFault) -> Self {
        if fault.is_corrupting() {
            log::error!(
                target: "telemetry",
                "corrupting engine failure during '{scenario}': code=0x{:08X} message={:?}",
                fault.code,
                fault.message
            );
        }
        Error::Engine { scenario, fault }
    }

    /// Stable numeric error identifier attached to the failure response.
    pub fn id(&self) -> u32 {
        match self {
            Error::MissingProperty(..) => 1001,
            Error::ProgramPlaceholder => 1001,
            Error::ProcessIdOnLaunch => 1001,
            Error::ProgramNotFound(_) => 1002,
            Error::WorkingDirectoryNotFound(_) => 1004,
            Error::InvalidProcessId => 1005,
            Error::ProcessIdPlaceholder => 1008,
            Error::MissingDebuggerPath => 1011,
            Error::ThreadNotFound(_) => 1010,
            Error::ConcurrentLaunch => 1012,
            Error::InvalidArguments(_) => 1013,
            Error::UnsupportedCommand(_) => 1014,
            Error::GotoNotSupported | Error::GotoTargetNotFound(_) => 1020,
            Error::EngineNotFound(_) | Error::NotInitialized => 1021,
            Error::CapabilityNotSupported(_) => 1022,
            Error::HoverEvaluation => 1101,
            Error::NoProgram => 1103,
            Error::LaunchMessage(_) | Error::Engine { .. } => 1104,
            Error::TargetNotStopped => 1105,
            Error::VariableNotFound(_) => 1106,
            Error::VariableReadOnly(_) | Error::SetVariableFailed(_) => 1107,
            Error::FrameNotFound(_) => 1108,
            Error::ExpressionParse(_) => 4001,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transforms `Result` into `Option` and logs the error as a warning.
/// Used where an event handler must not fail.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: literal) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "session", concat!($msg, ": {:#}"), e);
                None
            }
        }
    };
}
