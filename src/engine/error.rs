use std::borrow::Cow;
use std::fmt;

/// Well-known engine failure codes (HRESULT-style, as surfaced by native
/// debugger backends).
pub const E_FAIL: u32 = 0x8000_4005;
pub const E_ABORT: u32 = 0x8000_4004;
pub const E_NOTIMPL: u32 = 0x8000_4001;
pub const E_INVALIDARG: u32 = 0x8007_0057;
pub const E_ACCESSDENIED: u32 = 0x8007_0005;
pub const E_OUTOFMEMORY: u32 = 0x8007_000E;
pub const E_TIMEOUT: u32 = 0x8007_05B4;

/// How bad a fault is. `Corrupting` marks failures of the
/// null-dereference/access-violation class crossing the engine boundary;
/// they are reported in full to the telemetry log target before being
/// turned into an ordinary failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Failure,
    Corrupting,
}

/// A failed engine operation.
///
/// `message` carries engine-provided diagnostic text verbatim when the
/// engine supplied any; otherwise the numeric code is translated through
/// [`describe_code`].
#[derive(Debug, Clone)]
pub struct EngineFault {
    pub code: u32,
    pub message: Option<String>,
    pub severity: Severity,
}

impl EngineFault {
    pub fn new(code: u32) -> Self {
        EngineFault {
            code,
            message: None,
            severity: Severity::Failure,
        }
    }

    pub fn with_message(code: u32, message: impl Into<String>) -> Self {
        EngineFault {
            code,
            message: Some(message.into()),
            severity: Severity::Failure,
        }
    }

    pub fn corrupting(code: u32, message: impl Into<String>) -> Self {
        EngineFault {
            code,
            message: Some(message.into()),
            severity: Severity::Corrupting,
        }
    }

    pub fn is_corrupting(&self) -> bool {
        self.severity == Severity::Corrupting
    }

    /// Human-readable text: the engine message verbatim when present,
    /// otherwise the translated code.
    pub fn describe(&self) -> Cow<'_, str> {
        match &self.message {
            Some(message) => Cow::Borrowed(message.as_str()),
            None => describe_code(self.code),
        }
    }
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for EngineFault {}

/// Translate a well-known failure code to text.
pub fn describe_code(code: u32) -> Cow<'static, str> {
    match code {
        E_FAIL => Cow::Borrowed("Unspecified error"),
        E_ABORT => Cow::Borrowed("Operation aborted"),
        E_NOTIMPL => Cow::Borrowed("Not implemented"),
        E_INVALIDARG => Cow::Borrowed("Invalid argument"),
        E_ACCESSDENIED => Cow::Borrowed("Access is denied"),
        E_OUTOFMEMORY => Cow::Borrowed("Not enough memory"),
        E_TIMEOUT => Cow::Borrowed("The operation timed out"),
        _ => Cow::Owned(format!("Unknown error: 0x{code:08X}")),
    }
}

pub type EngineResult<T> = Result<T, EngineFault>;
