//! The debug session core: one instance per client connection. Client
//! requests arrive serialized on the request thread; the engine calls back
//! asynchronously on its own thread(s) through [`events`]. A narrow
//! general-purpose mutex guards session-level mutable state; the handle
//! tables and registries carry their own leaf locks. None of the locks is
//! held across an engine call.

pub mod breakpoints;
pub mod error;
pub mod events;
pub mod gate;
pub mod handles;
pub mod registry;
pub mod variables;

pub use error::Error;
pub use events::SessionSink;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use itertools::Itertools;
use once_cell::sync::OnceCell;

use crate::engine::{
    BreakpointLocation, BreakpointSpec, CodeContext, DataAccessKind, Engine, ExceptionSetting,
    LaunchSpec, MessageSeverity, Process, Program, PropertyQuery, StackFrame, StepGranularity,
    StepKind, ThreadRef, VariableCategory,
};
use crate::proto::{self, ClientEvent, OutputCategory, StopReason};
use crate::session::breakpoints::{
    normalize_path_key, plan, BreakpointRecord, BreakpointStore, Fingerprint,
};
use crate::session::gate::Gate;
use crate::session::handles::HandleTable;
use crate::session::registry::{ModuleRegistry, ThreadRegistry};
use crate::session::variables::VariableManager;
use crate::tracepoint::Tracepoint;
use crate::weak_error;

pub const EVALUATION_RADIX: u32 = 10;
pub const EVALUATION_TIMEOUT_MS: u32 = 5000;
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Receiver of client-visible events. Implemented by the transport layer;
/// must tolerate being called from any thread.
pub trait ClientSink: Send + Sync {
    fn send(&self, event: ClientEvent);
}

/// Adapter-id to engine mapping, filled by the embedding application.
#[derive(Default)]
pub struct EngineCatalog {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter_id: impl Into<String>, engine: Arc<dyn Engine>) {
        self.engines.insert(adapter_id.into(), engine);
    }

    pub fn get(&self, adapter_id: &str) -> Option<Arc<dyn Engine>> {
        self.engines.get(adapter_id).cloned()
    }
}

/// Which frontend is on the other side of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ClientIdentity {
    #[strum(serialize = "vscode")]
    VsCode,
    #[strum(serialize = "visualstudio")]
    VisualStudio,
    #[default]
    #[strum(disabled)]
    Other,
}

impl ClientIdentity {
    fn parse(value: Option<&str>) -> Self {
        value
            .and_then(|v| ClientIdentity::from_str(v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client: ClientIdentity,
    pub lines_start_at_1: bool,
    pub just_my_code: bool,
    pub require_exact_source: bool,
    pub enable_step_filtering: bool,
    pub stop_at_entry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            client: ClientIdentity::Other,
            lines_start_at_1: true,
            just_my_code: true,
            require_exact_source: true,
            enable_step_filtering: true,
            stop_at_entry: false,
        }
    }
}

/// Set only while a launch/attach is in flight. Captures the first
/// error/warning message-box event the engine raises so it can be surfaced
/// as the failure reason instead of a generic translated code.
#[derive(Default)]
struct LaunchSlot {
    error: Option<(MessageSeverity, String)>,
}

#[derive(Default)]
struct SessionState {
    stopped: bool,
    stepping: bool,
    is_attach: bool,
    config: SessionConfig,
    process: Option<Arc<dyn Process>>,
    program: Option<Arc<dyn Program>>,
    process_name: String,
    launch: Option<LaunchSlot>,
    first_stop_seen: bool,
    break_count: u32,
}

pub struct Session {
    catalog: EngineCatalog,
    client: Arc<dyn ClientSink>,
    engine: OnceCell<Arc<dyn Engine>>,
    state: Mutex<SessionState>,
    config_done: Gate,
    terminated: Gate,
    frames: HandleTable<Arc<dyn StackFrame>>,
    variables: VariableManager,
    breakpoints: Mutex<BreakpointStore>,
    modules: Mutex<ModuleRegistry>,
    threads: Mutex<ThreadRegistry>,
    frame_cache: Mutex<HashMap<i64, Vec<Arc<dyn StackFrame>>>>,
    goto_targets: HandleTable<Arc<dyn CodeContext>>,
}

impl Session {
    pub fn new(catalog: EngineCatalog, client: Arc<dyn ClientSink>) -> Arc<Session> {
        Arc::new(Session {
            catalog,
            client,
            engine: OnceCell::new(),
            state: Mutex::new(SessionState::default()),
            config_done: Gate::new(),
            terminated: Gate::new(),
            frames: HandleTable::new(),
            variables: VariableManager::new(),
            breakpoints: Mutex::new(BreakpointStore::new()),
            modules: Mutex::new(ModuleRegistry::new()),
            threads: Mutex::new(ThreadRegistry::new()),
            frame_cache: Mutex::new(HashMap::new()),
            goto_targets: HandleTable::new(),
        })
    }

    fn engine(&self) -> Result<Arc<dyn Engine>, Error> {
        self.engine.get().cloned().ok_or(Error::NotInitialized)
    }

    // ------------------------------------------------------------------
    // lifecycle requests

    pub fn initialize(&self, args: proto::InitializeArgs) -> Result<proto::Capabilities, Error> {
        let adapter_id = args
            .adapter_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(Error::MissingProperty("initialize", "adapterID"))?;

        let engine = self
            .catalog
            .get(adapter_id)
            .ok_or_else(|| Error::EngineNotFound(adapter_id.to_string()))?;

        {
            let mut state = self.state.lock().unwrap();
            state.config.client = ClientIdentity::parse(args.client_id.as_deref());
            state.config.lines_start_at_1 = args.lines_start_at1.unwrap_or(true);
        }

        log::info!(target: "session", "initialized for engine '{}'", engine.name());

        let capabilities = proto::Capabilities {
            supports_configuration_done_request: true,
            supports_function_breakpoints: engine.supports_function_breakpoints(),
            supports_conditional_breakpoints: engine.supports_conditional_breakpoints(),
            supports_evaluate_for_hovers: true,
            supports_set_variable: true,
            supports_modules_request: true,
            supports_goto_targets_request: engine.as_goto_targets().is_some(),
            supports_read_memory_request: engine.as_memory_access().is_some(),
            supports_disassemble_request: engine.as_disassembly().is_some(),
            supports_completions_request: engine.as_completions().is_some(),
            supports_data_breakpoints: engine.as_data_breakpoints().is_some(),
            supports_instruction_breakpoints: true,
            supports_log_points: true,
            supports_stepping_granularity: true,
            exception_breakpoint_filters: engine
                .exception_filters()
                .into_iter()
                .map(|desc| proto::ExceptionBreakpointsFilter {
                    filter: desc.filter,
                    label: desc.label,
                    supports_condition: Some(desc.supports_condition),
                    default: Some(desc.default_enabled),
                })
                .collect(),
        };

        let _ = self.engine.set(engine);
        Ok(capabilities)
    }

    pub fn launch(self: &Arc<Self>, args: proto::LaunchArgs) -> Result<(), Error> {
        let engine = self.engine()?;

        let program = args
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(Error::MissingProperty("launch", "program"))?
            .to_string();

        // A template the user never edited: fail before any engine call.
        if program.ends_with('>') && program.contains('<') {
            return Err(Error::ProgramPlaceholder);
        }

        if args.process_id.is_some() {
            return Err(Error::ProcessIdOnLaunch);
        }

        // Pipe transports and debug servers talk to remote machines; local
        // filesystem checks would be meaningless there.
        let skip_filesystem_checks =
            args.pipe_transport.is_some() || args.mi_debugger_server_address.is_some();

        if !skip_filesystem_checks && !Path::new(&program).exists() {
            return Err(Error::ProgramNotFound(program));
        }

        let cwd = args
            .cwd
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        if !skip_filesystem_checks {
            let cwd = cwd
                .as_deref()
                .ok_or(Error::MissingProperty("launch", "cwd"))?;
            if !Path::new(cwd).is_dir() {
                return Err(Error::WorkingDirectoryNotFound(cwd.to_string()));
            }
        }

        let stop_at_entry = args.stop_at_entry.unwrap_or(false);
        {
            let mut state = self.state.lock().unwrap();
            if state.launch.is_some() {
                return Err(Error::ConcurrentLaunch);
            }
            state.launch = Some(LaunchSlot::default());
            state.is_attach = false;
            state.process_name = program.clone();
            state.config.just_my_code = args.just_my_code.unwrap_or(state.config.just_my_code);
            state.config.require_exact_source = args
                .require_exact_source
                .unwrap_or(state.config.require_exact_source);
            state.config.enable_step_filtering = args
                .enable_step_filtering
                .unwrap_or(state.config.enable_step_filtering);
            state.config.stop_at_entry = stop_at_entry;
        }

        let spec = LaunchSpec {
            program,
            args: args.args.unwrap_or_default(),
            cwd,
            attach_pid: None,
            no_debug: args.no_debug.unwrap_or(false),
            stop_at_entry,
            remote_target: args.mi_debugger_server_address,
        };

        let result = self.start_suspended(&engine, &spec, "Unable to start debugging");
        self.finish_launch(result)
    }

    pub fn attach(self: &Arc<Self>, args: proto::AttachArgs) -> Result<(), Error> {
        let engine = self.engine()?;

        let is_pipe = args.pipe_transport.is_some();
        let is_server = args.mi_debugger_server_address.is_some();

        let program = args
            .program
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(Error::MissingProperty("attach", "program"))?
            .to_string();

        if is_pipe {
            let has_debugger_path = args
                .pipe_transport
                .as_ref()
                .and_then(|pipe| pipe.debugger_path.as_deref())
                .is_some_and(|path| !path.is_empty());
            if !has_debugger_path {
                return Err(Error::MissingDebuggerPath);
            }
        }

        let pid = if is_server {
            None
        } else {
            let pid = parse_process_id(args.process_id.as_ref())?;
            if pid == 0 {
                return Err(Error::ProcessIdPlaceholder);
            }
            Some(pid)
        };

        if !is_pipe && !is_server && !Path::new(&program).exists() {
            return Err(Error::ProgramNotFound(program));
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.launch.is_some() {
                return Err(Error::ConcurrentLaunch);
            }
            state.launch = Some(LaunchSlot::default());
            state.is_attach = true;
            state.process_name = program.clone();
            state.config.just_my_code = args.just_my_code.unwrap_or(state.config.just_my_code);
            state.config.require_exact_source = args
                .require_exact_source
                .unwrap_or(state.config.require_exact_source);
            state.config.enable_step_filtering = args
                .enable_step_filtering
                .unwrap_or(state.config.enable_step_filtering);
        }

        let spec = LaunchSpec {
            program,
            args: Vec::new(),
            cwd: None,
            attach_pid: pid,
            no_debug: false,
            stop_at_entry: false,
            remote_target: args.mi_debugger_server_address,
        };

        let result = self.start_suspended(&engine, &spec, "Unable to attach");
        self.finish_launch(result)
    }

    /// Launch-suspended then resume, terminating the half-started process
    /// when the resume fails.
    fn start_suspended(
        self: &Arc<Self>,
        engine: &Arc<dyn Engine>,
        spec: &LaunchSpec,
        scenario: &'static str,
    ) -> Result<Arc<dyn Process>, Error> {
        let sink = Arc::new(SessionSink::new(self.clone()));
        let process = engine
            .launch_suspended(spec, sink)
            .map_err(|fault| Error::engine(scenario, fault))?;

        if let Err(fault) = engine.resume(&*process) {
            let _ = engine.terminate(&*process);
            return Err(Error::engine(scenario, fault));
        }

        Ok(process)
    }

    /// Leave the launch critical section: prefer a captured engine message
    /// over the translated failure, and surface a leftover message from a
    /// successful launch as an output event.
    fn finish_launch(&self, result: Result<Arc<dyn Process>, Error>) -> Result<(), Error> {
        let captured = {
            let mut state = self.state.lock().unwrap();
            let captured = state.launch.take().and_then(|slot| slot.error);
            if let Ok(process) = &result {
                state.process = Some(process.clone());
            }
            captured
        };

        match result {
            Ok(_) => {
                if let Some((severity, message)) = captured {
                    self.send_message(severity, &message);
                }
                log::info!(target: "session", "debuggee launched");
                Ok(())
            }
            Err(error) => match captured {
                Some((_, message)) => Err(Error::LaunchMessage(message)),
                None => Err(error),
            },
        }
    }

    /// Release the one-shot configuration gate. The engine's
    /// program-created handler is blocked on it; calling this twice is a
    /// no-op.
    pub fn configuration_done(&self) -> Result<(), Error> {
        if self.config_done.open() {
            log::debug!(target: "session", "configuration done");
        }
        Ok(())
    }

    /// Tear the session down. Never fails: problems degrade to warnings so
    /// the client is not left hanging.
    pub fn disconnect(&self, args: proto::DisconnectArgs) -> Result<(), Error> {
        // If the engine is still waiting to run past program-create,
        // unblock it.
        self.config_done.open();

        let (process, program, is_attach, process_name) = {
            let mut state = self.state.lock().unwrap();
            (
                state.process.take(),
                state.program.take(),
                state.is_attach,
                state.process_name.clone(),
            )
        };

        if let Some(process) = process {
            let keep_alive = is_attach || args.terminate_debuggee == Some(false);
            let result = if keep_alive {
                match program {
                    Some(program) => program.detach(),
                    None => Ok(()),
                }
            } else {
                match self.engine() {
                    Ok(engine) => engine.terminate(&*process),
                    Err(_) => Ok(()),
                }
            };

            let warning = match result {
                Err(fault) => Some(format!(
                    "Unable to terminate process '{process_name}': {fault}"
                )),
                Ok(()) => {
                    if self.terminated.wait_timeout(DISCONNECT_TIMEOUT) {
                        None
                    } else {
                        Some(format!(
                            "The debugger did not confirm termination of '{process_name}'"
                        ))
                    }
                }
            };

            if let Some(warning) = warning {
                log::warn!(target: "session", "{warning}");
                self.output(OutputCategory::Stderr, format!("Warning: {warning}\n"));
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // execution control

    pub fn continue_request(&self, thread_id: i64) -> Result<proto::ContinueResponseBody, Error> {
        self.require_stopped()?;
        let thread = self.resolve_optional_thread(thread_id)?;
        let program = self.program()?;

        self.before_continue();
        if let Err(fault) = program.continue_run(thread.as_deref()) {
            // The debuggee did not actually resume.
            self.state.lock().unwrap().stopped = true;
            return Err(Error::engine("Unable to continue", fault));
        }

        Ok(proto::ContinueResponseBody {
            all_threads_continued: true,
        })
    }

    pub fn step(
        &self,
        thread_id: i64,
        kind: StepKind,
        granularity: StepGranularity,
    ) -> Result<(), Error> {
        self.require_stopped()?;
        let thread = self
            .threads
            .lock()
            .unwrap()
            .get(thread_id)
            .ok_or(Error::ThreadNotFound(thread_id))?;
        let program = self.program()?;

        let scenario = match kind {
            StepKind::Over => "Unable to step next",
            StepKind::Into => "Unable to step in",
            StepKind::Out => "Unable to step out",
        };

        self.state.lock().unwrap().stepping = true;
        self.before_continue();
        if let Err(fault) = program.step(&*thread, kind, granularity) {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            state.stepping = false;
            return Err(Error::engine(scenario, fault));
        }

        Ok(())
    }

    /// Fire-and-forget interrupt; completion arrives as an async-break
    /// event.
    pub fn pause(&self, args: proto::PauseArgs) -> Result<(), Error> {
        if let Some(thread_id) = args.thread_id {
            if thread_id != 0 {
                self.threads
                    .lock()
                    .unwrap()
                    .get(thread_id)
                    .ok_or(Error::ThreadNotFound(thread_id))?;
            }
        }
        let program = self.program()?;
        program
            .cause_break()
            .map_err(|fault| Error::engine("Unable to pause", fault))
    }

    // ------------------------------------------------------------------
    // inspection requests

    pub fn threads(&self) -> Result<proto::ThreadsResponseBody, Error> {
        // Snapshot under the lock, query names outside it.
        let threads = self.threads.lock().unwrap().snapshot();
        let list = threads
            .into_iter()
            .map(|thread| proto::Thread {
                id: thread.id(),
                name: thread.name(),
            })
            .sorted_by_key(|thread| thread.id)
            .collect_vec();
        Ok(proto::ThreadsResponseBody { threads: list })
    }

    pub fn modules(&self) -> Result<proto::ModulesResponseBody, Error> {
        let modules = self.modules.lock().unwrap().snapshot();
        let list = modules
            .into_iter()
            .map(|(id, module)| module_to_proto(id, &*module))
            .collect_vec();
        let total = list.len();
        Ok(proto::ModulesResponseBody {
            modules: list,
            total_modules: total,
        })
    }

    pub fn stack_trace(
        &self,
        args: proto::StackTraceArgs,
    ) -> Result<proto::StackTraceResponseBody, Error> {
        self.require_stopped()?;

        let start_frame = args.start_frame.unwrap_or(0);
        let levels = args.levels.unwrap_or(0);
        if start_frame < 0 || levels < 0 {
            return Ok(proto::StackTraceResponseBody {
                stack_frames: Vec::new(),
                total_frames: 0,
            });
        }

        let thread = self
            .threads
            .lock()
            .unwrap()
            .get(args.thread_id)
            .ok_or(Error::ThreadNotFound(args.thread_id))?;

        // Frame enumeration is cached per thread within one stopped epoch.
        let frames = {
            let mut cache = self.frame_cache.lock().unwrap();
            match cache.entry(args.thread_id) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let frames = thread.frames(EVALUATION_RADIX).map_err(|fault| {
                        Error::engine("Unable to enumerate stack frames", fault)
                    })?;
                    entry.insert(frames.clone());
                    frames
                }
            }
        };

        let total = frames.len() as i64;
        let start = start_frame as usize;
        if start >= frames.len() {
            return Ok(proto::StackTraceResponseBody {
                stack_frames: Vec::new(),
                total_frames: total,
            });
        }

        let take = if levels == 0 {
            frames.len() - start
        } else {
            (levels as usize).min(frames.len() - start)
        };

        let mut stack_frames = Vec::with_capacity(take);
        for frame in &frames[start..start + take] {
            let id = self.frames.create(frame.clone());
            let location = frame.location();
            let (source, line, column) = match location {
                Some(location) => (
                    Some(proto::Source {
                        name: Some(file_name(&location.path)),
                        path: Some(location.path),
                    }),
                    self.engine_line_to_client(location.line),
                    location.column,
                ),
                None => (None, 0, 0),
            };
            stack_frames.push(proto::StackFrame {
                id,
                name: frame.name(),
                source,
                line,
                column,
                instruction_pointer_reference: frame.instruction_pointer(),
            });
        }

        Ok(proto::StackTraceResponseBody {
            stack_frames,
            total_frames: total,
        })
    }

    pub fn scopes(&self, args: proto::ScopesArgs) -> Result<proto::ScopesResponseBody, Error> {
        self.require_stopped()?;
        let frame = self
            .frames
            .try_get(args.frame_id)
            .ok_or(Error::FrameNotFound(args.frame_id))?;

        let query = self.property_query(false);
        let mut scopes = Vec::new();

        let locals = frame
            .properties(VariableCategory::Locals, query)
            .unwrap_or_default();
        if !locals.is_empty() {
            scopes.push(proto::Scope {
                name: "Locals".to_string(),
                variables_reference: self
                    .variables
                    .create_scope(frame.clone(), VariableCategory::Locals),
                expensive: false,
                presentation_hint: Some("locals".to_string()),
            });
        }

        let registers = frame
            .properties(VariableCategory::Registers, query)
            .unwrap_or_default();
        if !registers.is_empty() {
            scopes.push(proto::Scope {
                name: "Registers".to_string(),
                variables_reference: self
                    .variables
                    .create_scope(frame.clone(), VariableCategory::Registers),
                expensive: true,
                presentation_hint: Some("registers".to_string()),
            });
        }

        Ok(proto::ScopesResponseBody { scopes })
    }

    pub fn variables(
        &self,
        args: proto::VariablesArgs,
    ) -> Result<proto::VariablesResponseBody, Error> {
        self.require_stopped()?;
        let variables = self
            .variables
            .expand(args.variables_reference, self.property_query(false))?;
        Ok(proto::VariablesResponseBody { variables })
    }

    pub fn set_variable(
        &self,
        args: proto::SetVariableArgs,
    ) -> Result<proto::SetVariableResponseBody, Error> {
        self.require_stopped()?;
        let value = self.variables.set_variable(
            args.variables_reference,
            &args.name,
            &args.value,
            self.property_query(false),
        )?;
        Ok(proto::SetVariableResponseBody { value })
    }

    pub fn evaluate(&self, args: proto::EvaluateArgs) -> Result<proto::EvaluateResponseBody, Error> {
        self.require_stopped()?;

        let is_hover = args.context.as_deref() == Some("hover");
        let is_exec_command = args.expression.starts_with("-exec");

        // Console -exec commands without a frame evaluate off the top one.
        let frame = match args.frame_id {
            Some(frame_id) if frame_id >= 0 => self
                .frames
                .try_get(frame_id)
                .ok_or(Error::FrameNotFound(frame_id))?,
            _ if is_exec_command => self
                .frames
                .try_get_first()
                .ok_or(Error::FrameNotFound(-1))?,
            _ => return Err(Error::FrameNotFound(args.frame_id.unwrap_or(-1))),
        };

        let expression = frame
            .parse_expression(&args.expression)
            .map_err(|fault| Error::ExpressionParse(fault.describe().into_owned()))?;

        let query = self.property_query(is_hover);
        let property = expression
            .evaluate(query)
            .map_err(|fault| Error::engine("Unable to evaluate the expression", fault))?;

        let info = property
            .info(query)
            .map_err(|fault| Error::engine("Unable to evaluate the expression", fault))?;

        // Error results must fail hover requests so UIs suppress the
        // tooltip instead of rendering the error text.
        if info.error_value && is_hover {
            return Err(Error::HoverEvaluation);
        }

        let variable = self.variables.create_variable(&property, query)?;
        Ok(proto::EvaluateResponseBody {
            result: variable.value,
            type_name: variable.type_name,
            variables_reference: variable.variables_reference,
            memory_reference: variable.memory_reference,
        })
    }

    pub fn completions(
        &self,
        args: proto::CompletionsArgs,
    ) -> Result<proto::CompletionsResponseBody, Error> {
        self.require_stopped()?;
        let engine = self.engine()?;
        let provider = engine
            .as_completions()
            .ok_or(Error::CapabilityNotSupported("completions"))?;

        let frame = args.frame_id.and_then(|id| self.frames.try_get(id));
        let completions = provider
            .completions(frame.as_deref(), &args.text, args.column)
            .map_err(|fault| Error::engine("Unable to compute completions", fault))?;

        Ok(proto::CompletionsResponseBody {
            targets: completions
                .into_iter()
                .map(|completion| proto::CompletionItem {
                    label: completion.label,
                    text: completion.text,
                    start: completion.start,
                    length: completion.length,
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // breakpoints

    /// Set the source breakpoints for one file. This request never hard
    /// fails: a hard failure would abort the client's whole launch
    /// sequence, so every problem degrades to a per-breakpoint unverified
    /// result.
    pub fn set_breakpoints(
        &self,
        args: proto::SetBreakpointsArgs,
    ) -> proto::SetBreakpointsResponseBody {
        let requested = args.breakpoints.unwrap_or_default();

        let Some(path) = args.source.path.as_deref() else {
            // Sources without a path cannot be keyed.
            let store = self.breakpoints.lock().unwrap();
            let breakpoints = requested
                .iter()
                .map(|bp| {
                    proto::Breakpoint::unbound(
                        store.next_id(),
                        Some(bp.line),
                        "Source breakpoints require a file path",
                    )
                })
                .collect();
            drop(store);
            return proto::SetBreakpointsResponseBody { breakpoints };
        };
        let path = normalize_path_key(path);
        let source_modified = args.source_modified.unwrap_or(false);

        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(error) => {
                let store = self.breakpoints.lock().unwrap();
                let breakpoints = requested
                    .iter()
                    .map(|bp| {
                        proto::Breakpoint::unbound(store.next_id(), Some(bp.line), error.to_string())
                    })
                    .collect();
                drop(store);
                return proto::SetBreakpointsResponseBody { breakpoints };
            }
        };

        let requested_keys: Vec<(u32, Fingerprint)> = requested
            .iter()
            .map(|bp| {
                (
                    bp.line,
                    Fingerprint::new(bp.condition.clone(), bp.log_message.clone()),
                )
            })
            .collect();

        let mut store = self.breakpoints.lock().unwrap();
        let reconcile = plan(
            store.source_table(&path),
            &requested_keys,
            source_modified,
        );

        for line in &reconcile.delete {
            if let Some(record) = store.source_table(&path).shift_remove(line) {
                weak_error!(record.pending.delete(), "delete breakpoint");
            }
        }

        let mut breakpoints = Vec::with_capacity(requested.len());
        for bp in &requested {
            if reconcile.keep.contains(&bp.line) {
                let record = store
                    .source_table(&path)
                    .get(&bp.line)
                    .expect("kept breakpoint must exist");
                // Answer from the cached bind result when the engine
                // already reported one.
                breakpoints.push(match &record.bind_result {
                    Some(cached) => cached.clone(),
                    None => proto::Breakpoint::bound(record.id, Some(bp.line)),
                });
                continue;
            }

            if let Some(existing) = store.source_table(&path).get(&bp.line) {
                // Duplicate line within one request: answer like a keep.
                breakpoints.push(match &existing.bind_result {
                    Some(cached) => cached.clone(),
                    None => proto::Breakpoint::bound(existing.id, Some(bp.line)),
                });
                continue;
            }

            let id = store.next_id();

            let tracepoint = match &bp.log_message {
                Some(message) if !message.is_empty() => match Tracepoint::parse(message) {
                    Ok(tracepoint) => Some(tracepoint),
                    Err(error) => {
                        breakpoints.push(proto::Breakpoint::unbound(
                            id,
                            Some(bp.line),
                            error.to_string(),
                        ));
                        continue;
                    }
                },
                _ => None,
            };

            let spec = BreakpointSpec {
                id,
                location: BreakpointLocation::Source {
                    path: path.clone(),
                    line: self.client_line_to_engine(bp.line),
                },
                condition: bp.condition.clone(),
            };

            match create_and_bind(&engine, &spec) {
                Ok(pending) => {
                    store.source_table(&path).insert(
                        bp.line,
                        BreakpointRecord {
                            id,
                            fingerprint: Fingerprint::new(
                                bp.condition.clone(),
                                bp.log_message.clone(),
                            ),
                            tracepoint,
                            pending,
                            bind_result: None,
                            requested_line: Some(bp.line),
                        },
                    );
                    breakpoints.push(proto::Breakpoint::bound(id, Some(bp.line)));
                }
                Err(fault) => {
                    let error = Error::engine("Unable to set breakpoint", fault);
                    breakpoints.push(proto::Breakpoint::unbound(
                        id,
                        Some(bp.line),
                        error.to_string(),
                    ));
                }
            }
        }

        proto::SetBreakpointsResponseBody { breakpoints }
    }

    pub fn set_function_breakpoints(
        &self,
        args: proto::SetFunctionBreakpointsArgs,
    ) -> proto::SetBreakpointsResponseBody {
        let requested: Vec<(String, Fingerprint)> = args
            .breakpoints
            .iter()
            .map(|bp| {
                (
                    bp.name.clone(),
                    Fingerprint::new(bp.condition.clone(), None),
                )
            })
            .collect();

        self.reconcile_keyed_table(requested, breakpoints::BreakpointKind::Function, |name| {
            BreakpointLocation::Function { name: name.clone() }
        })
    }

    pub fn set_instruction_breakpoints(
        &self,
        args: proto::SetInstructionBreakpointsArgs,
    ) -> proto::SetBreakpointsResponseBody {
        let requested: Vec<(String, Fingerprint)> = args
            .breakpoints
            .iter()
            .map(|bp| {
                let key = match bp.offset.unwrap_or(0) {
                    0 => bp.instruction_reference.clone(),
                    offset => format!("{}+{offset}", bp.instruction_reference),
                };
                (key, Fingerprint::new(bp.condition.clone(), None))
            })
            .collect();

        self.reconcile_keyed_table(
            requested,
            breakpoints::BreakpointKind::Instruction,
            |reference| BreakpointLocation::Address {
                memory_reference: reference.clone(),
            },
        )
    }

    pub fn set_data_breakpoints(
        &self,
        args: proto::SetDataBreakpointsArgs,
    ) -> proto::SetBreakpointsResponseBody {
        let accesses: HashMap<String, DataAccessKind> = args
            .breakpoints
            .iter()
            .map(|bp| {
                (
                    bp.data_id.clone(),
                    parse_access_kind(bp.access_type.as_deref()),
                )
            })
            .collect();

        let requested: Vec<(String, Fingerprint)> = args
            .breakpoints
            .iter()
            .map(|bp| {
                (
                    bp.data_id.clone(),
                    Fingerprint::new(bp.condition.clone(), None),
                )
            })
            .collect();

        self.reconcile_keyed_table(requested, breakpoints::BreakpointKind::Data, |data_id| {
            BreakpointLocation::Data {
                data_id: data_id.clone(),
                access: accesses
                    .get(data_id)
                    .copied()
                    .unwrap_or(DataAccessKind::Write),
            }
        })
    }

    /// Shared reconcile-and-apply for the three string-keyed tables.
    fn reconcile_keyed_table(
        &self,
        requested: Vec<(String, Fingerprint)>,
        kind: breakpoints::BreakpointKind,
        location: impl Fn(&String) -> BreakpointLocation,
    ) -> proto::SetBreakpointsResponseBody {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(error) => {
                let store = self.breakpoints.lock().unwrap();
                let breakpoints = requested
                    .iter()
                    .map(|_| proto::Breakpoint::unbound(store.next_id(), None, error.to_string()))
                    .collect();
                return proto::SetBreakpointsResponseBody { breakpoints };
            }
        };

        let mut store = self.breakpoints.lock().unwrap();
        let reconcile = plan(store.keyed_table(kind), &requested, false);

        for key in &reconcile.delete {
            if let Some(record) = store.keyed_table(kind).shift_remove(key) {
                weak_error!(record.pending.delete(), "delete breakpoint");
            }
        }

        let mut breakpoints = Vec::with_capacity(requested.len());
        for (key, fingerprint) in &requested {
            if let Some(record) = store.keyed_table(kind).get(key) {
                breakpoints.push(match &record.bind_result {
                    Some(cached) => cached.clone(),
                    None => proto::Breakpoint::bound(record.id, None),
                });
                continue;
            }

            let id = store.next_id();
            let spec = BreakpointSpec {
                id,
                location: location(key),
                condition: fingerprint.condition.clone(),
            };

            match create_and_bind(&engine, &spec) {
                Ok(pending) => {
                    store.keyed_table(kind).insert(
                        key.clone(),
                        BreakpointRecord {
                            id,
                            fingerprint: fingerprint.clone(),
                            tracepoint: None,
                            pending,
                            bind_result: None,
                            requested_line: None,
                        },
                    );
                    breakpoints.push(proto::Breakpoint::bound(id, None));
                }
                Err(fault) => {
                    let error = Error::engine("Unable to set breakpoint", fault);
                    breakpoints.push(proto::Breakpoint::unbound(id, None, error.to_string()));
                }
            }
        }

        proto::SetBreakpointsResponseBody { breakpoints }
    }

    pub fn data_breakpoint_info(
        &self,
        args: proto::DataBreakpointInfoArgs,
    ) -> Result<proto::DataBreakpointInfoResponseBody, Error> {
        self.require_stopped()?;
        let engine = self.engine()?;

        let unavailable = |description: &str| proto::DataBreakpointInfoResponseBody {
            data_id: None,
            description: description.to_string(),
            access_types: None,
        };

        let Some(provider) = engine.as_data_breakpoints() else {
            return Ok(unavailable(
                "Data breakpoints are not supported by the loaded debug engine",
            ));
        };

        let Some(reference) = args.variables_reference else {
            return Ok(unavailable("A variable container is required"));
        };

        let property = match self.variables.find_expanded(reference, &args.name) {
            Some(property) => Some(property),
            None => {
                // Not expanded yet in this epoch; populate the lookup and
                // retry.
                let _ = self.variables.expand(reference, self.property_query(false))?;
                self.variables.find_expanded(reference, &args.name)
            }
        };
        let Some(property) = property else {
            return Ok(unavailable(&format!("Unknown variable '{}'", args.name)));
        };

        let descriptor = provider
            .data_breakpoint_info(&*property)
            .map_err(|fault| Error::engine("Unable to inspect data breakpoint target", fault))?;

        Ok(proto::DataBreakpointInfoResponseBody {
            data_id: descriptor.data_id,
            description: descriptor.description,
            access_types: Some(
                descriptor
                    .access_kinds
                    .iter()
                    .map(|kind| access_kind_name(*kind).to_string())
                    .collect(),
            ),
        })
    }

    pub fn set_exception_breakpoints(
        &self,
        args: proto::SetExceptionBreakpointsArgs,
    ) -> Result<(), Error> {
        let engine = self.engine()?;
        let known: Vec<String> = engine
            .exception_filters()
            .into_iter()
            .map(|desc| desc.filter)
            .collect();

        let mut settings = Vec::new();

        for filter in args.filters.unwrap_or_default() {
            if known.contains(&filter) {
                settings.push(ExceptionSetting {
                    filter,
                    condition: None,
                });
            } else {
                log::warn!(target: "session", "ignoring unknown exception filter '{filter}'");
            }
        }

        for option in args.filter_options.unwrap_or_default() {
            if known.contains(&option.filter_id) {
                settings.push(ExceptionSetting {
                    filter: option.filter_id,
                    condition: option.condition,
                });
            } else {
                log::warn!(
                    target: "session",
                    "ignoring unknown exception filter '{}'",
                    option.filter_id
                );
            }
        }

        engine
            .set_exceptions(&settings)
            .map_err(|fault| Error::engine("Unable to set exception breakpoints", fault))
    }

    // ------------------------------------------------------------------
    // goto targets

    pub fn goto_targets(
        &self,
        args: proto::GotoTargetsArgs,
    ) -> Result<proto::GotoTargetsResponseBody, Error> {
        self.require_stopped()?;
        let engine = self.engine()?;
        let provider = engine
            .as_goto_targets()
            .ok_or(Error::CapabilityNotSupported("goto targets"))?;

        let path = args
            .source
            .path
            .as_deref()
            .ok_or(Error::MissingProperty("gotoTargets", "source.path"))?;

        let contexts = provider
            .code_contexts(path, self.client_line_to_engine(args.line))
            .map_err(|fault| Error::engine("Unable to compute goto targets", fault))?;

        let targets = contexts
            .into_iter()
            .map(|context| {
                let id = self.goto_targets.create(context.clone());
                let (label, line) = match context.location() {
                    Some(location) => {
                        let line = self.engine_line_to_client(location.line);
                        (format!("{}:{line}", file_name(&location.path)), line)
                    }
                    None => (context.memory_reference(), args.line),
                };
                proto::GotoTarget {
                    id,
                    label,
                    line,
                    instruction_pointer_reference: Some(context.memory_reference()),
                }
            })
            .collect();

        Ok(proto::GotoTargetsResponseBody { targets })
    }

    /// Executing a goto is not implemented; the target table is still
    /// consulted so stale ids fail distinctly.
    pub fn goto(&self, args: proto::GotoArgs) -> Result<(), Error> {
        self.goto_targets
            .try_get(args.target_id)
            .ok_or(Error::GotoTargetNotFound(args.target_id))?;
        Err(Error::GotoNotSupported)
    }

    // ------------------------------------------------------------------
    // memory and disassembly

    pub fn read_memory(
        &self,
        args: proto::ReadMemoryArgs,
    ) -> Result<proto::ReadMemoryResponseBody, Error> {
        self.require_stopped()?;
        let engine = self.engine()?;
        let provider = engine
            .as_memory_access()
            .ok_or(Error::CapabilityNotSupported("memory reads"))?;

        let chunk = provider
            .read_memory(&args.memory_reference, args.offset.unwrap_or(0), args.count)
            .map_err(|fault| Error::engine("Unable to read memory", fault))?;

        Ok(proto::ReadMemoryResponseBody {
            address: chunk.address,
            unreadable_bytes: (chunk.unreadable > 0).then_some(chunk.unreadable),
            data: base64::engine::general_purpose::STANDARD.encode(chunk.data),
        })
    }

    pub fn disassemble(
        &self,
        args: proto::DisassembleArgs,
    ) -> Result<proto::DisassembleResponseBody, Error> {
        self.require_stopped()?;
        let engine = self.engine()?;
        let provider = engine
            .as_disassembly()
            .ok_or(Error::CapabilityNotSupported("disassembly"))?;

        let instructions = provider
            .disassemble(
                &args.memory_reference,
                args.offset.unwrap_or(0),
                args.instruction_offset.unwrap_or(0),
                args.instruction_count,
            )
            .map_err(|fault| Error::engine("Unable to disassemble", fault))?;

        Ok(proto::DisassembleResponseBody {
            instructions: instructions
                .into_iter()
                .map(|instruction| {
                    let (location, line) = match instruction.location {
                        Some(location) => {
                            let line = self.engine_line_to_client(location.line);
                            (
                                Some(proto::Source {
                                    name: Some(file_name(&location.path)),
                                    path: Some(location.path),
                                }),
                                Some(line),
                            )
                        }
                        None => (None, None),
                    };
                    proto::DisassembledInstruction {
                        address: instruction.address,
                        instruction: instruction.instruction,
                        instruction_bytes: instruction.bytes,
                        location,
                        line,
                    }
                })
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // shared internals

    fn program(&self) -> Result<Arc<dyn Program>, Error> {
        self.state
            .lock()
            .unwrap()
            .program
            .clone()
            .ok_or(Error::NoProgram)
    }

    fn require_stopped(&self) -> Result<(), Error> {
        if self.state.lock().unwrap().stopped {
            Ok(())
        } else {
            Err(Error::TargetNotStopped)
        }
    }

    /// Thread id 0 means "no particular thread"; any other id must be
    /// registered.
    fn resolve_optional_thread(&self, thread_id: i64) -> Result<Option<Arc<dyn ThreadRef>>, Error> {
        if thread_id == 0 {
            return Ok(None);
        }
        self.threads
            .lock()
            .unwrap()
            .get(thread_id)
            .map(Some)
            .ok_or(Error::ThreadNotFound(thread_id))
    }

    fn property_query(&self, hover: bool) -> PropertyQuery {
        let just_my_code = self.state.lock().unwrap().config.just_my_code;
        PropertyQuery {
            radix: EVALUATION_RADIX,
            timeout_ms: EVALUATION_TIMEOUT_MS,
            no_side_effects: hover,
            public_members_only: just_my_code,
        }
    }

    /// Drop every per-stop table before the debuggee resumes. Handles
    /// issued in the ending epoch become invalid here; a stopped
    /// notification is never emitted with a partially cleared table set.
    fn before_continue(&self) {
        self.state.lock().unwrap().stopped = false;
        self.frames.reset();
        self.variables.reset();
        self.goto_targets.reset();
        self.frame_cache.lock().unwrap().clear();
    }

    /// Flip to stopped and deliver the notification from a worker thread:
    /// enumerating frame positions on the engine callback thread risks
    /// re-entering the engine mid-callback.
    fn fire_stopped(
        self: &Arc<Self>,
        thread: &Arc<dyn ThreadRef>,
        reason: StopReason,
        text: Option<String>,
        hit_breakpoint_ids: Option<Vec<u32>>,
    ) {
        debug_assert!(self.frames.is_empty(), "frame handles survived a resume");
        debug_assert!(self.variables.is_empty(), "variable handles survived a resume");

        let first_stop = {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
            state.stepping = false;
            state.break_count += 1;
            !std::mem::replace(&mut state.first_stop_seen, true)
        };

        if first_stop {
            self.output(
                OutputCategory::Console,
                "Debug console ready: prefix engine commands with -exec\n",
            );
        }

        let this = self.clone();
        let thread = thread.clone();
        std::thread::spawn(move || {
            let position = thread
                .frames(EVALUATION_RADIX)
                .ok()
                .and_then(|frames| frames.iter().find_map(|frame| frame.location()));

            let (source, line, column) = match position {
                Some(location) => (
                    Some(proto::Source {
                        name: Some(file_name(&location.path)),
                        path: Some(location.path.clone()),
                    }),
                    Some(this.engine_line_to_client(location.line)),
                    Some(location.column),
                ),
                None => (None, None, None),
            };

            this.client.send(ClientEvent::Stopped(proto::StoppedEventBody {
                reason: reason.as_ref().to_string(),
                thread_id: Some(thread.id()),
                all_threads_stopped: true,
                source,
                line,
                column,
                text,
                hit_breakpoint_ids,
            }));
        });
    }

    fn output(&self, category: OutputCategory, text: impl Into<String>) {
        self.client.send(ClientEvent::Output(proto::OutputEventBody {
            category: category.as_ref().to_string(),
            output: text.into(),
        }));
    }

    fn send_message(&self, severity: MessageSeverity, text: &str) {
        let (prefix, category) = match severity {
            MessageSeverity::Error => ("Error: ", OutputCategory::Stderr),
            MessageSeverity::Warning => ("Warning: ", OutputCategory::Stderr),
            MessageSeverity::None => ("", OutputCategory::Console),
        };
        self.output(category, format!("{prefix}{text}\n"));
    }

    fn client_line_to_engine(&self, line: u32) -> u32 {
        if self.state.lock().unwrap().config.lines_start_at_1 {
            line
        } else {
            line + 1
        }
    }

    fn engine_line_to_client(&self, line: u32) -> u32 {
        if self.state.lock().unwrap().config.lines_start_at_1 {
            line
        } else {
            line.saturating_sub(1)
        }
    }
}

fn create_and_bind(
    engine: &Arc<dyn Engine>,
    spec: &BreakpointSpec,
) -> crate::engine::EngineResult<Arc<dyn crate::engine::PendingBreakpoint>> {
    let pending = engine.create_breakpoint(spec)?;
    pending.bind()?;
    Ok(pending)
}

fn parse_process_id(value: Option<&serde_json::Value>) -> Result<i64, Error> {
    let value = value.ok_or(Error::MissingProperty("attach", "processId"))?;
    match value {
        serde_json::Value::Number(number) => number.as_i64().ok_or(Error::InvalidProcessId),
        serde_json::Value::String(text) => text.trim().parse().map_err(|_| Error::InvalidProcessId),
        _ => Err(Error::InvalidProcessId),
    }
}

fn parse_access_kind(value: Option<&str>) -> DataAccessKind {
    match value {
        Some("read") => DataAccessKind::Read,
        Some("readWrite") => DataAccessKind::ReadWrite,
        _ => DataAccessKind::Write,
    }
}

fn access_kind_name(kind: DataAccessKind) -> &'static str {
    match kind {
        DataAccessKind::Read => "read",
        DataAccessKind::Write => "write",
        DataAccessKind::ReadWrite => "readWrite",
    }
}

fn module_to_proto(id: i64, module: &dyn crate::engine::Module) -> proto::Module {
    proto::Module {
        id,
        name: module.name(),
        path: module.path(),
        version: module.version(),
        symbol_status: if module.symbols_loaded() {
            "Symbols loaded.".to_string()
        } else {
            "Symbols not found.".to_string()
        },
        address_range: module.load_address().map(|address| format!("0x{address:016X}")),
    }
}

fn file_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}
