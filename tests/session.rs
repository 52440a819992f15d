mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use dapbridge::engine::{Engine, EngineEvent, StepGranularity, StepKind};
use dapbridge::proto::{
    ClientEvent, DataBreakpointInfoArgs, DisconnectArgs, EvaluateArgs, GotoArgs, GotoTargetsArgs,
    InitializeArgs, LaunchArgs, ScopesArgs, SetBreakpointsArgs, SetVariableArgs, Source,
    SourceBreakpoint, StackTraceArgs, VariablesArgs,
};
use dapbridge::session::{EngineCatalog, Session};

fn source(path: &str) -> Source {
    Source {
        name: None,
        path: Some(path.to_string()),
    }
}

fn breakpoint(line: u32) -> SourceBreakpoint {
    SourceBreakpoint {
        line,
        condition: None,
        log_message: None,
    }
}

fn set_lines(
    session: &Arc<Session>,
    path: &str,
    breakpoints: Vec<SourceBreakpoint>,
) -> Vec<dapbridge::proto::Breakpoint> {
    session
        .set_breakpoints(SetBreakpointsArgs {
            source: source(path),
            breakpoints: Some(breakpoints),
            source_modified: None,
        })
        .breakpoints
}

// ---------------------------------------------------------------------------
// launch validation

#[test]
fn launch_with_placeholder_program_fails_before_any_engine_call() {
    let engine = MockEngine::new();
    let client = RecordingClient::new();
    let mut catalog = EngineCatalog::new();
    catalog.register("mock", engine.clone() as Arc<dyn Engine>);
    let session = Session::new(catalog, client);

    session
        .initialize(InitializeArgs {
            adapter_id: Some("mock".to_string()),
            ..Default::default()
        })
        .unwrap();

    let error = session
        .launch(LaunchArgs {
            program: Some("<insert the program path here>".to_string()),
            cwd: Some("/tmp".to_string()),
            ..Default::default()
        })
        .unwrap_err();

    assert_eq!(error.id(), 1001);
    assert_eq!(engine.launches.load(Ordering::SeqCst), 0);
}

#[test]
fn launch_failure_prefers_the_engine_message_over_the_translated_code() {
    let engine = MockEngine::new();
    let client = RecordingClient::new();
    let mut catalog = EngineCatalog::new();
    catalog.register("mock", engine.clone() as Arc<dyn Engine>);
    let session = Session::new(catalog, client);

    session
        .initialize(InitializeArgs {
            adapter_id: Some("mock".to_string()),
            ..Default::default()
        })
        .unwrap();

    *engine.launch_message.lock().unwrap() =
        Some("Unable to find the kernel symbols".to_string());

    let error = session
        .launch(LaunchArgs {
            program: Some(std::env::current_exe().unwrap().display().to_string()),
            cwd: Some(std::env::temp_dir().display().to_string()),
            ..Default::default()
        })
        .unwrap_err();

    assert_eq!(error.to_string(), "Unable to find the kernel symbols");
}

#[test]
fn unknown_adapter_id_is_rejected() {
    let client = RecordingClient::new();
    let session = Session::new(EngineCatalog::new(), client);
    let error = session
        .initialize(InitializeArgs {
            adapter_id: Some("gdb".to_string()),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(error.id(), 1021);
}

// ---------------------------------------------------------------------------
// configuration rendezvous

#[test]
fn configuration_done_is_idempotent() {
    let fixture = launched_fixture();
    // The fixture already called it once; further calls are no-ops.
    fixture.session.configuration_done().unwrap();
    fixture.session.configuration_done().unwrap();
}

#[test]
fn disconnect_releases_a_pending_configuration_gate() {
    let engine = MockEngine::new();
    let client = RecordingClient::new();
    let mut catalog = EngineCatalog::new();
    catalog.register("mock", engine.clone() as Arc<dyn Engine>);
    let session = Session::new(catalog, client);

    session
        .initialize(InitializeArgs {
            adapter_id: Some("mock".to_string()),
            ..Default::default()
        })
        .unwrap();
    session
        .launch(LaunchArgs {
            program: Some(std::env::current_exe().unwrap().display().to_string()),
            cwd: Some(std::env::temp_dir().display().to_string()),
            ..Default::default()
        })
        .unwrap();

    let ack = engine.fire(EngineEvent::ProgramCreated {
        program: Arc::new(MockProgram::default()),
    });
    assert!(!ack.wait(Duration::from_millis(100)));

    // Never configured; disconnect must still unblock the engine.
    session.disconnect(DisconnectArgs::default()).unwrap();
    assert!(ack.wait(Duration::from_secs(2)));
}

// ---------------------------------------------------------------------------
// breakpoints

#[test]
fn repeated_set_breakpoints_reuses_the_engine_breakpoint() {
    let fixture = launched_fixture();
    let first = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(10)]);
    assert_eq!(first.len(), 1);
    assert!(first[0].verified);
    assert_eq!(fixture.engine.created_breakpoints.load(Ordering::SeqCst), 1);

    let second = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(10)]);
    assert_eq!(second, first);
    assert_eq!(fixture.engine.created_breakpoints.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.engine.deleted_breakpoints.load(Ordering::SeqCst), 0);
}

#[test]
fn changing_a_condition_recreates_the_breakpoint() {
    let fixture = launched_fixture();
    let first = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(10)]);

    let changed = set_lines(
        &fixture.session,
        "/src/app/main.c",
        vec![SourceBreakpoint {
            line: 10,
            condition: Some("a > 1".to_string()),
            log_message: None,
        }],
    );

    assert_ne!(changed[0].id, first[0].id);
    assert_eq!(fixture.engine.created_breakpoints.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.engine.deleted_breakpoints.load(Ordering::SeqCst), 1);
}

#[test]
fn breakpoints_missing_from_the_request_are_deleted() {
    let fixture = launched_fixture();
    set_lines(
        &fixture.session,
        "/src/app/main.c",
        vec![breakpoint(10), breakpoint(20)],
    );
    let remaining = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(20)]);

    assert_eq!(remaining.len(), 1);
    assert_eq!(fixture.engine.deleted_breakpoints.load(Ordering::SeqCst), 1);
}

#[test]
fn bound_events_overwrite_the_cached_answer() {
    let fixture = launched_fixture();
    let first = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(10)]);
    let id = first[0].id;

    fixture.engine.fire(EngineEvent::BreakpointBound {
        breakpoint_id: id,
        line: Some(12),
    });

    fixture
        .client
        .wait_for(
            |event| matches!(event, ClientEvent::Breakpoint(body) if body.breakpoint.id == id),
            Duration::from_secs(1),
        )
        .expect("breakpoint changed event");

    // The engine's authoritative line answers later requests.
    let again = set_lines(&fixture.session, "/src/app/main.c", vec![breakpoint(10)]);
    assert_eq!(again[0].line, Some(12));
    assert!(again[0].verified);
    assert_eq!(fixture.engine.created_breakpoints.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_log_messages_degrade_to_unverified_results() {
    let fixture = launched_fixture();
    let result = set_lines(
        &fixture.session,
        "/src/app/main.c",
        vec![SourceBreakpoint {
            line: 10,
            condition: None,
            log_message: Some("unterminated {x".to_string()),
        }],
    );

    assert_eq!(result.len(), 1);
    assert!(!result[0].verified);
    assert!(result[0].message.as_deref().unwrap().contains("invalid log message"));
    // The request itself never fails and no engine breakpoint is created.
    assert_eq!(fixture.engine.created_breakpoints.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// tracepoints

#[test]
fn tracepoints_log_and_continue_instead_of_stopping() {
    let fixture = stopped_fixture();
    let result = set_lines(
        &fixture.session,
        "/src/app/main.c",
        vec![SourceBreakpoint {
            line: 7,
            condition: None,
            log_message: Some("a is {a+1}".to_string()),
        }],
    );
    let id = result[0].id;
    let stops_before = fixture.client.stopped_events().len();
    let continues_before = fixture.program.continues.load(Ordering::SeqCst);

    // Resume, then hit the tracepoint.
    fixture.session.continue_request(1).unwrap();
    fixture.engine.fire(EngineEvent::BreakpointHit {
        thread: fixture.thread.clone(),
        breakpoint_ids: vec![id],
    });

    fixture
        .client
        .wait_for(
            |event| {
                matches!(event, ClientEvent::Output(body) if body.output.contains("a is 2"))
            },
            Duration::from_secs(2),
        )
        .expect("formatted tracepoint message");

    // No stop notification, and execution resumed on its own.
    assert_eq!(fixture.client.stopped_events().len(), stops_before);
    assert!(fixture.program.continues.load(Ordering::SeqCst) > continues_before + 1);
}

#[test]
fn a_tracepoint_hit_during_a_step_still_stops_with_the_step_reason() {
    let fixture = stopped_fixture();
    let result = set_lines(
        &fixture.session,
        "/src/app/main.c",
        vec![SourceBreakpoint {
            line: 7,
            condition: None,
            log_message: Some("hit".to_string()),
        }],
    );
    let id = result[0].id;

    fixture
        .session
        .step(1, StepKind::Into, StepGranularity::Statement)
        .unwrap();
    let stops_before = fixture.client.stopped_events().len();

    fixture.engine.fire(EngineEvent::BreakpointHit {
        thread: fixture.thread.clone(),
        breakpoint_ids: vec![id],
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while fixture.client.stopped_events().len() <= stops_before {
        assert!(Instant::now() < deadline, "expected a stop notification");
        std::thread::sleep(Duration::from_millis(5));
    }

    let stopped = fixture.client.stopped_events();
    assert_eq!(stopped.last().unwrap().reason, "step");
}

// ---------------------------------------------------------------------------
// handles across stop/continue cycles

#[test]
fn continue_invalidates_every_per_stop_handle() {
    let fixture = stopped_fixture();

    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap();
    let frame_id = trace.stack_frames[0].id;

    let scopes = fixture.session.scopes(ScopesArgs { frame_id }).unwrap();
    let scope_ref = scopes.scopes[0].variables_reference;
    assert!(fixture
        .session
        .variables(VariablesArgs {
            variables_reference: scope_ref,
        })
        .is_ok());

    fixture.session.continue_request(1).unwrap();

    // Stop again: the old references belong to a dead epoch.
    stop(&fixture);
    let error = fixture
        .session
        .variables(VariablesArgs {
            variables_reference: scope_ref,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1106);

    let error = fixture.session.scopes(ScopesArgs { frame_id }).unwrap_err();
    assert_eq!(error.id(), 1108);
}

#[test]
fn handles_are_monotonic_within_one_stopped_epoch() {
    let fixture = stopped_fixture();
    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap();

    let ids: Vec<i32> = trace.stack_frames.iter().map(|frame| frame.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted, "frame handles must be unique and increasing");
    assert!(ids.iter().all(|id| *id > 0));
}

// ---------------------------------------------------------------------------
// stack traces

#[test]
fn start_frame_past_the_end_returns_the_true_total() {
    let fixture = stopped_fixture();
    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: Some(5),
            levels: None,
        })
        .unwrap();

    assert!(trace.stack_frames.is_empty());
    assert_eq!(trace.total_frames, 3);
}

#[test]
fn stack_trace_pages_through_the_cached_enumeration() {
    let fixture = stopped_fixture();
    let page = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: Some(1),
            levels: Some(1),
        })
        .unwrap();

    assert_eq!(page.stack_frames.len(), 1);
    assert_eq!(page.stack_frames[0].name, "outer");
    assert_eq!(page.total_frames, 3);
}

#[test]
fn unknown_thread_ids_fail_the_request_only() {
    let fixture = stopped_fixture();
    let error = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 99,
            start_frame: None,
            levels: None,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1010);

    // The session is still healthy.
    assert!(fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .is_ok());
}

// ---------------------------------------------------------------------------
// variables

fn scope_reference(fixture: &Fixture) -> i32 {
    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap();
    let scopes = fixture
        .session
        .scopes(ScopesArgs {
            frame_id: trace.stack_frames[0].id,
        })
        .unwrap();
    scopes.scopes[0].variables_reference
}

#[test]
fn duplicate_child_names_are_disambiguated_in_order() {
    let fixture = stopped_fixture();
    let scope_ref = scope_reference(&fixture);

    let locals = fixture
        .session
        .variables(VariablesArgs {
            variables_reference: scope_ref,
        })
        .unwrap();
    let aggregate = locals
        .variables
        .iter()
        .find(|variable| variable.name == "s")
        .expect("aggregate local");
    assert!(aggregate.variables_reference > 0);

    let children = fixture
        .session
        .variables(VariablesArgs {
            variables_reference: aggregate.variables_reference,
        })
        .unwrap();
    let names: Vec<&str> = children
        .variables
        .iter()
        .map(|variable| variable.name.as_str())
        .collect();
    assert_eq!(names, vec!["x", "x #2", "x #3"]);
}

#[test]
fn set_variable_rejects_read_only_properties() {
    let fixture = stopped_fixture();
    let scope_ref = scope_reference(&fixture);

    let error = fixture
        .session
        .set_variable(SetVariableArgs {
            variables_reference: scope_ref,
            name: "ro".to_string(),
            value: "9".to_string(),
        })
        .unwrap_err();
    assert_eq!(error.id(), 1107);
}

#[test]
fn set_variable_returns_the_new_display_value() {
    let fixture = stopped_fixture();
    let scope_ref = scope_reference(&fixture);

    let result = fixture
        .session
        .set_variable(SetVariableArgs {
            variables_reference: scope_ref,
            name: "a".to_string(),
            value: "41".to_string(),
        })
        .unwrap();
    assert_eq!(result.value, "41");
}

#[test]
fn requests_requiring_a_stopped_target_fail_while_running() {
    let fixture = launched_fixture();

    let error = fixture
        .session
        .variables(VariablesArgs {
            variables_reference: 1000,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1105);

    let error = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1105);
}

// ---------------------------------------------------------------------------
// evaluation

#[test]
fn hover_evaluation_of_an_error_result_fails_the_request() {
    let fixture = stopped_fixture();
    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap();

    let error = fixture
        .session
        .evaluate(EvaluateArgs {
            expression: "bad".to_string(),
            frame_id: Some(trace.stack_frames[0].id),
            context: Some("hover".to_string()),
        })
        .unwrap_err();
    assert_eq!(error.id(), 1101);

    // The same evaluation in watch context returns the error rendering.
    let watch = fixture
        .session
        .evaluate(EvaluateArgs {
            expression: "bad".to_string(),
            frame_id: Some(trace.stack_frames[0].id),
            context: Some("watch".to_string()),
        })
        .unwrap();
    assert!(watch.result.contains("undefined"));
}

#[test]
fn expression_parse_failures_carry_the_engine_text() {
    let fixture = stopped_fixture();
    let trace = fixture
        .session
        .stack_trace(StackTraceArgs {
            thread_id: 1,
            start_frame: None,
            levels: None,
        })
        .unwrap();

    let error = fixture
        .session
        .evaluate(EvaluateArgs {
            expression: "no_such_symbol".to_string(),
            frame_id: Some(trace.stack_frames[0].id),
            context: None,
        })
        .unwrap_err();
    assert_eq!(error.id(), 4001);
    assert!(error.to_string().contains("no_such_symbol"));
}

// ---------------------------------------------------------------------------
// data breakpoints and goto targets

#[test]
fn data_breakpoint_info_resolves_expanded_variables() {
    let fixture = stopped_fixture();
    let scope_ref = scope_reference(&fixture);

    let info = fixture
        .session
        .data_breakpoint_info(DataBreakpointInfoArgs {
            variables_reference: Some(scope_ref),
            name: "a".to_string(),
        })
        .unwrap();
    assert_eq!(info.data_id.as_deref(), Some("&a"));
}

#[test]
fn goto_execution_is_rejected_but_targets_resolve() {
    let fixture = stopped_fixture();
    let targets = fixture
        .session
        .goto_targets(GotoTargetsArgs {
            source: source("/src/app/main.c"),
            line: 12,
        })
        .unwrap();
    assert_eq!(targets.targets.len(), 1);

    let error = fixture
        .session
        .goto(GotoArgs {
            thread_id: 1,
            target_id: targets.targets[0].id,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1020);

    let error = fixture
        .session
        .goto(GotoArgs {
            thread_id: 1,
            target_id: 9999,
        })
        .unwrap_err();
    assert_eq!(error.id(), 1020);
}

// ---------------------------------------------------------------------------
// lifecycle

#[test]
fn disconnect_returns_within_the_timeout_without_a_termination_signal() {
    let fixture = launched_fixture();

    let started = Instant::now();
    fixture
        .session
        .disconnect(DisconnectArgs {
            terminate_debuggee: None,
        })
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(fixture.engine.terminates.load(Ordering::SeqCst), 1);
    assert!(
        elapsed < Duration::from_secs(4),
        "disconnect blocked for {elapsed:?}"
    );
}

#[test]
fn program_destruction_emits_exit_and_termination() {
    let fixture = launched_fixture();
    fixture
        .engine
        .fire(EngineEvent::ProgramDestroyed { exit_code: 3 });

    fixture
        .client
        .wait_for(
            |event| matches!(event, ClientEvent::Exited(body) if body.exit_code == 3),
            Duration::from_secs(1),
        )
        .expect("exited event");
    fixture
        .client
        .wait_for(
            |event| matches!(event, ClientEvent::Terminated),
            Duration::from_secs(1),
        )
        .expect("terminated event");

    // A disconnect after termination returns immediately.
    let started = Instant::now();
    fixture
        .session
        .disconnect(DisconnectArgs {
            terminate_debuggee: Some(true),
        })
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn thread_lifecycle_events_track_the_registry() {
    let fixture = stopped_fixture();
    let second = MockThread::new(2, default_frames());
    fixture.engine.fire(EngineEvent::ThreadCreated {
        thread: second.clone(),
    });

    let threads = fixture.session.threads().unwrap();
    assert_eq!(threads.threads.len(), 2);

    fixture
        .engine
        .fire(EngineEvent::ThreadExited { thread: second });
    let threads = fixture.session.threads().unwrap();
    assert_eq!(threads.threads.len(), 1);

    let error = fixture.session.continue_request(2).unwrap_err();
    assert_eq!(error.id(), 1010);
}
