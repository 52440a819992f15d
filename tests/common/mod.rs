//! Scripted engine and capturing client used by the session scenario
//! suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use dapbridge::engine::{
    BreakpointSpec, CodeContext, DataAccessKind, DataBreakpointDescriptor, DataBreakpoints,
    Engine, EngineEvent, EngineEventSink, EngineFault, EngineResult, EventAck,
    ExceptionFilterDesc, ExceptionSetting, Expression, GotoTargets, LaunchSpec, MessageClass,
    MessageSeverity, PendingBreakpoint, Process, Program, Property, PropertyInfo, PropertyQuery,
    SourceLocation, StackFrame, StepGranularity, StepKind, ThreadRef, VariableCategory,
};
use dapbridge::engine::error::{E_ABORT, E_FAIL, E_INVALIDARG};
use dapbridge::proto::{ClientEvent, InitializeArgs, LaunchArgs};
use dapbridge::session::{ClientSink, EngineCatalog, Session};

// ---------------------------------------------------------------------------
// client sink

pub struct RecordingClient {
    events: Mutex<Vec<ClientEvent>>,
    cond: Condvar,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingClient {
            events: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        })
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until any recorded event satisfies the predicate.
    pub fn wait_for(
        &self,
        predicate: impl Fn(&ClientEvent) -> bool,
        timeout: Duration,
    ) -> Option<ClientEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if let Some(event) = events.iter().find(|event| predicate(event)) {
                return Some(event.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(events, deadline - now).unwrap();
            events = guard;
        }
    }

    pub fn stopped_events(&self) -> Vec<dapbridge::proto::StoppedEventBody> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Stopped(body) => Some(body),
                _ => None,
            })
            .collect()
    }
}

impl ClientSink for RecordingClient {
    fn send(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// engine objects

pub struct MockProperty {
    info: Mutex<PropertyInfo>,
    children: Mutex<Vec<Arc<MockProperty>>>,
    set_fault: Option<EngineFault>,
}

impl MockProperty {
    pub fn scalar(name: &str, value: &str) -> Arc<Self> {
        Arc::new(MockProperty {
            info: Mutex::new(PropertyInfo {
                name: name.to_string(),
                value: value.to_string(),
                type_name: Some("int".to_string()),
                full_name: Some(name.to_string()),
                expandable: false,
                read_only: false,
                error_value: false,
                memory_reference: None,
            }),
            children: Mutex::new(Vec::new()),
            set_fault: None,
        })
    }

    pub fn read_only(name: &str, value: &str) -> Arc<Self> {
        let property = Self::scalar(name, value);
        property.info.lock().unwrap().read_only = true;
        property
    }

    pub fn error_value(name: &str, message: &str) -> Arc<Self> {
        let property = Self::scalar(name, message);
        property.info.lock().unwrap().error_value = true;
        property
    }

    pub fn expandable(name: &str, value: &str, children: Vec<Arc<MockProperty>>) -> Arc<Self> {
        let property = Self::scalar(name, value);
        property.info.lock().unwrap().expandable = true;
        *property.children.lock().unwrap() = children;
        property
    }
}

impl Property for MockProperty {
    fn info(&self, _query: PropertyQuery) -> EngineResult<PropertyInfo> {
        Ok(self.info.lock().unwrap().clone())
    }

    fn children(&self, _query: PropertyQuery) -> EngineResult<Vec<Arc<dyn Property>>> {
        Ok(self
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|child| child.clone() as Arc<dyn Property>)
            .collect())
    }

    fn set_value(&self, value: &str, _query: PropertyQuery) -> EngineResult<()> {
        if let Some(fault) = &self.set_fault {
            return Err(fault.clone());
        }
        self.info.lock().unwrap().value = value.to_string();
        Ok(())
    }
}

struct MockExpression(Arc<MockProperty>);

impl Expression for MockExpression {
    fn evaluate(&self, _query: PropertyQuery) -> EngineResult<Arc<dyn Property>> {
        Ok(self.0.clone() as Arc<dyn Property>)
    }
}

pub struct MockFrame {
    pub frame_name: String,
    pub source: Option<SourceLocation>,
    pub locals: Vec<Arc<MockProperty>>,
    pub registers: Vec<Arc<MockProperty>>,
    pub expressions: HashMap<String, Arc<MockProperty>>,
}

impl MockFrame {
    pub fn new(name: &str, path: &str, line: u32) -> Self {
        MockFrame {
            frame_name: name.to_string(),
            source: Some(SourceLocation {
                path: path.to_string(),
                line,
                column: 1,
            }),
            locals: Vec::new(),
            registers: Vec::new(),
            expressions: HashMap::new(),
        }
    }
}

impl StackFrame for MockFrame {
    fn name(&self) -> String {
        self.frame_name.clone()
    }

    fn location(&self) -> Option<SourceLocation> {
        self.source.clone()
    }

    fn instruction_pointer(&self) -> Option<String> {
        None
    }

    fn properties(
        &self,
        category: VariableCategory,
        _query: PropertyQuery,
    ) -> EngineResult<Vec<Arc<dyn Property>>> {
        let source = match category {
            VariableCategory::Locals => &self.locals,
            VariableCategory::Registers => &self.registers,
        };
        Ok(source
            .iter()
            .map(|property| property.clone() as Arc<dyn Property>)
            .collect())
    }

    fn parse_expression(&self, expression: &str) -> EngineResult<Arc<dyn Expression>> {
        match self.expressions.get(expression) {
            Some(property) => Ok(Arc::new(MockExpression(property.clone()))),
            None => Err(EngineFault::with_message(
                E_INVALIDARG,
                format!("unknown identifier '{expression}'"),
            )),
        }
    }
}

pub struct MockThread {
    pub thread_id: i64,
    pub frames: Mutex<Vec<Arc<dyn StackFrame>>>,
}

impl MockThread {
    pub fn new(thread_id: i64, frames: Vec<Arc<dyn StackFrame>>) -> Arc<Self> {
        Arc::new(MockThread {
            thread_id,
            frames: Mutex::new(frames),
        })
    }
}

impl ThreadRef for MockThread {
    fn id(&self) -> i64 {
        self.thread_id
    }

    fn name(&self) -> String {
        format!("Thread #{}", self.thread_id)
    }

    fn frames(&self, _radix: u32) -> EngineResult<Vec<Arc<dyn StackFrame>>> {
        Ok(self.frames.lock().unwrap().clone())
    }
}

struct MockProcess;

impl Process for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn name(&self) -> String {
        "mock-debuggee".to_string()
    }
}

#[derive(Default)]
pub struct MockProgram {
    pub continues: AtomicUsize,
    pub steps: AtomicUsize,
    pub breaks: AtomicUsize,
    pub detaches: AtomicUsize,
}

impl Program for MockProgram {
    fn continue_run(&self, _thread: Option<&dyn ThreadRef>) -> EngineResult<()> {
        self.continues.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn step(
        &self,
        _thread: &dyn ThreadRef,
        _kind: StepKind,
        _granularity: StepGranularity,
    ) -> EngineResult<()> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cause_break(&self) -> EngineResult<()> {
        self.breaks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) -> EngineResult<()> {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockPending {
    deleted: Arc<AtomicUsize>,
}

impl PendingBreakpoint for MockPending {
    fn bind(&self) -> EngineResult<()> {
        Ok(())
    }

    fn delete(&self) -> EngineResult<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockContext {
    reference: String,
    source: Option<SourceLocation>,
}

impl CodeContext for MockContext {
    fn memory_reference(&self) -> String {
        self.reference.clone()
    }

    fn location(&self) -> Option<SourceLocation> {
        self.source.clone()
    }
}

// ---------------------------------------------------------------------------
// the engine

pub struct MockEngine {
    pub created_breakpoints: AtomicUsize,
    pub deleted_breakpoints: Arc<AtomicUsize>,
    pub launches: AtomicUsize,
    pub resumes: AtomicUsize,
    pub terminates: AtomicUsize,
    pub breakpoint_specs: Mutex<Vec<BreakpointSpec>>,
    pub exception_settings: Mutex<Vec<ExceptionSetting>>,
    /// When set, `launch_suspended` raises this message through the sink
    /// and fails with E_ABORT.
    pub launch_message: Mutex<Option<String>>,
    sink: Mutex<Option<Arc<dyn EngineEventSink>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine {
            created_breakpoints: AtomicUsize::new(0),
            deleted_breakpoints: Arc::new(AtomicUsize::new(0)),
            launches: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            breakpoint_specs: Mutex::new(Vec::new()),
            exception_settings: Mutex::new(Vec::new()),
            launch_message: Mutex::new(None),
            sink: Mutex::new(None),
        })
    }

    pub fn sink(&self) -> Arc<dyn EngineEventSink> {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("engine has no sink; launch first")
    }

    /// Deliver an event on the current thread, as the engine callback
    /// thread would, and return a probe for the continuation gate.
    pub fn fire(&self, event: EngineEvent) -> AckProbe {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        self.sink()
            .event(event, EventAck::new(move || flag.store(true, Ordering::SeqCst)));
        AckProbe { completed }
    }
}

pub struct AckProbe {
    completed: Arc<AtomicBool>,
}

impl AckProbe {
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_completed() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.is_completed()
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn launch_suspended(
        &self,
        _spec: &LaunchSpec,
        sink: Arc<dyn EngineEventSink>,
    ) -> EngineResult<Arc<dyn Process>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink.clone());

        if let Some(message) = self.launch_message.lock().unwrap().clone() {
            sink.event(
                EngineEvent::Message {
                    class: MessageClass::MessageBox {
                        severity: MessageSeverity::Error,
                    },
                    text: message,
                },
                EventAck::noop(),
            );
            return Err(EngineFault::new(E_ABORT));
        }

        Ok(Arc::new(MockProcess))
    }

    fn resume(&self, _process: &dyn Process) -> EngineResult<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn terminate(&self, _process: &dyn Process) -> EngineResult<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_breakpoint(&self, spec: &BreakpointSpec) -> EngineResult<Arc<dyn PendingBreakpoint>> {
        self.created_breakpoints.fetch_add(1, Ordering::SeqCst);
        self.breakpoint_specs.lock().unwrap().push(spec.clone());
        Ok(Arc::new(MockPending {
            deleted: self.deleted_breakpoints.clone(),
        }))
    }

    fn set_exceptions(&self, settings: &[ExceptionSetting]) -> EngineResult<()> {
        *self.exception_settings.lock().unwrap() = settings.to_vec();
        Ok(())
    }

    fn exception_filters(&self) -> Vec<ExceptionFilterDesc> {
        vec![ExceptionFilterDesc {
            filter: "all".to_string(),
            label: "All Exceptions".to_string(),
            supports_condition: true,
            default_enabled: false,
        }]
    }

    fn supports_conditional_breakpoints(&self) -> bool {
        true
    }

    fn supports_function_breakpoints(&self) -> bool {
        true
    }

    fn set_metric(&self, _name: &str, _value: &str) {}

    fn pointer_size(&self) -> Option<u32> {
        Some(64)
    }

    fn as_data_breakpoints(&self) -> Option<&dyn DataBreakpoints> {
        Some(self)
    }

    fn as_goto_targets(&self) -> Option<&dyn GotoTargets> {
        Some(self)
    }
}

impl DataBreakpoints for MockEngine {
    fn data_breakpoint_info(&self, property: &dyn Property) -> EngineResult<DataBreakpointDescriptor> {
        let info = property.info(PropertyQuery::new(10, 1000))?;
        if info.read_only {
            return Err(EngineFault::new(E_FAIL));
        }
        Ok(DataBreakpointDescriptor {
            data_id: Some(format!("&{}", info.name)),
            description: info.name,
            access_kinds: vec![DataAccessKind::Write],
        })
    }
}

impl GotoTargets for MockEngine {
    fn code_contexts(&self, path: &str, line: u32) -> EngineResult<Vec<Arc<dyn CodeContext>>> {
        Ok(vec![Arc::new(MockContext {
            reference: format!("0x1000{line:02x}"),
            source: Some(SourceLocation {
                path: path.to_string(),
                line,
                column: 1,
            }),
        }) as Arc<dyn CodeContext>])
    }
}

// ---------------------------------------------------------------------------
// fixtures

pub struct Fixture {
    pub session: Arc<Session>,
    pub engine: Arc<MockEngine>,
    pub client: Arc<RecordingClient>,
    pub program: Arc<MockProgram>,
    pub thread: Arc<MockThread>,
}

pub fn default_frames() -> Vec<Arc<dyn StackFrame>> {
    let mut top = MockFrame::new("inner", "/src/app/main.c", 7);
    top.locals = vec![
        MockProperty::scalar("a", "1"),
        MockProperty::scalar("b", "2"),
        MockProperty::read_only("ro", "3"),
        MockProperty::expandable(
            "s",
            "{...}",
            vec![
                MockProperty::scalar("x", "10"),
                MockProperty::scalar("x", "11"),
                MockProperty::scalar("x", "12"),
            ],
        ),
    ];
    top.registers = vec![MockProperty::scalar("rip", "0x401000")];
    top.expressions
        .insert("a+1".to_string(), MockProperty::scalar("a+1", "2"));
    top.expressions.insert(
        "bad".to_string(),
        MockProperty::error_value("bad", "identifier 'bad' is undefined"),
    );

    vec![
        Arc::new(top) as Arc<dyn StackFrame>,
        Arc::new(MockFrame::new("outer", "/src/app/main.c", 21)),
        Arc::new(MockFrame::new("main", "/src/app/main.c", 40)),
    ]
}

/// Initialize + launch + configuration rendezvous + one live thread.
pub fn launched_fixture() -> Fixture {
    let engine = MockEngine::new();
    let client = RecordingClient::new();

    let mut catalog = EngineCatalog::new();
    catalog.register("mock", engine.clone() as Arc<dyn Engine>);
    let session = Session::new(catalog, client.clone());

    session
        .initialize(InitializeArgs {
            adapter_id: Some("mock".to_string()),
            client_id: Some("vscode".to_string()),
            ..Default::default()
        })
        .expect("initialize");

    session
        .launch(LaunchArgs {
            program: Some(std::env::current_exe().unwrap().display().to_string()),
            cwd: Some(std::env::temp_dir().display().to_string()),
            ..Default::default()
        })
        .expect("launch");

    let program = Arc::new(MockProgram::default());
    let ack = engine.fire(EngineEvent::ProgramCreated {
        program: program.clone(),
    });
    assert!(
        !ack.wait(Duration::from_millis(100)),
        "program-created must wait for configuration"
    );

    session.configuration_done().expect("configuration done");
    assert!(
        ack.wait(Duration::from_secs(2)),
        "configuration-done must release the engine"
    );

    let thread = MockThread::new(1, default_frames());
    engine
        .fire(EngineEvent::ThreadCreated {
            thread: thread.clone(),
        })
        .wait(Duration::from_secs(1));

    Fixture {
        session,
        engine,
        client,
        program,
        thread,
    }
}

/// A fixture already halted by an async break.
pub fn stopped_fixture() -> Fixture {
    let fixture = launched_fixture();
    stop(&fixture);
    fixture
}

/// Drive the fixture into the stopped state and wait for the stop
/// notification.
pub fn stop(fixture: &Fixture) {
    let before = fixture.client.stopped_events().len();
    fixture.engine.fire(EngineEvent::AsyncBreak {
        thread: fixture.thread.clone(),
    });
    let found = fixture.client.wait_for(
        |event| matches!(event, ClientEvent::Stopped(_)),
        Duration::from_secs(2),
    );
    assert!(found.is_some(), "no stopped notification arrived");
    // Wait for a *new* stopped event, not a stale one.
    let deadline = Instant::now() + Duration::from_secs(2);
    while fixture.client.stopped_events().len() <= before {
        assert!(Instant::now() < deadline, "no new stopped notification");
        std::thread::sleep(Duration::from_millis(5));
    }
}
