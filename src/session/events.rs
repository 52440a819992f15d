//! Engine event dispatch: a static match over the closed event sum type.
//! Synchronous kinds re-arm the engine's continuation gate immediately
//! after their handler runs; the one asynchronous kind (program-created)
//! defers the acknowledgment until the client finishes configuration.

use std::sync::Arc;

use crate::engine::{
    EngineEvent, EngineEventSink, EventAck, MessageClass, MessageSeverity, Module, Program,
    PropertyQuery, ThreadRef,
};
use crate::proto::{self, ClientEvent, OutputCategory, StopReason};
use crate::session::breakpoints::BreakpointKind;
use crate::session::{Session, EVALUATION_RADIX, EVALUATION_TIMEOUT_MS};
use crate::tracepoint::Tracepoint;
use crate::weak_error;

/// The session's face toward the engine callback channel.
pub struct SessionSink {
    session: Arc<Session>,
}

impl SessionSink {
    pub fn new(session: Arc<Session>) -> Self {
        SessionSink { session }
    }
}

impl EngineEventSink for SessionSink {
    fn event(&self, event: EngineEvent, ack: EventAck) {
        log::debug!(target: "events", "engine event: {}", event.kind());
        match event {
            EngineEvent::ProgramCreated { program } => {
                self.session.on_program_created(program, ack);
            }
            other => {
                self.session.on_engine_event(other);
                ack.complete();
            }
        }
    }
}

impl Session {
    /// The configuration rendezvous: record the program, tell the client
    /// we are ready for configuration, and keep the engine blocked until
    /// configuration-done (or disconnect) opens the gate.
    fn on_program_created(self: &Arc<Self>, program: Arc<dyn Program>, ack: EventAck) {
        let (process_name, process_id, is_attach) = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.program.is_none(), "duplicate program-created event");
            state.program = Some(program);
            (
                state.process_name.clone(),
                state.process.as_ref().and_then(|process| process.id()),
                state.is_attach,
            )
        };

        self.client.send(ClientEvent::Process(proto::ProcessEventBody {
            name: process_name,
            system_process_id: process_id,
            start_method: if is_attach { "attach" } else { "launch" }.to_string(),
            pointer_size: self.engine.get().and_then(|engine| engine.pointer_size()),
        }));
        self.client.send(ClientEvent::Initialized);

        let this = self.clone();
        std::thread::spawn(move || {
            this.config_done.wait();
            ack.complete();
        });
    }

    fn on_engine_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::EngineCreated => self.on_engine_created(),
            EngineEvent::ProgramCreated { .. } => unreachable!("dispatched as async"),
            EngineEvent::ProgramDestroyed { exit_code } => self.on_program_destroyed(exit_code),
            EngineEvent::StepComplete { thread } => {
                self.fire_stopped(&thread, StopReason::Step, None, None);
            }
            EngineEvent::EntryPoint { thread } => self.on_entry_point(&thread),
            EngineEvent::BreakpointHit {
                thread,
                breakpoint_ids,
            } => self.on_breakpoint_hit(&thread, breakpoint_ids),
            EngineEvent::AsyncBreak { thread } => {
                self.fire_stopped(&thread, StopReason::Pause, None, None);
            }
            EngineEvent::Exception {
                thread,
                description,
            } => {
                self.fire_stopped(&thread, StopReason::Exception, Some(description), None);
            }
            EngineEvent::ThreadCreated { thread } => {
                let id = thread.id();
                self.threads.lock().unwrap().register(thread);
                self.client.send(ClientEvent::Thread(proto::ThreadEventBody {
                    reason: "started".to_string(),
                    thread_id: id,
                }));
            }
            EngineEvent::ThreadExited { thread } => {
                let id = thread.id();
                self.threads.lock().unwrap().remove(id);
                self.client.send(ClientEvent::Thread(proto::ThreadEventBody {
                    reason: "exited".to_string(),
                    thread_id: id,
                }));
            }
            EngineEvent::ModuleLoaded { module } => {
                let id = self.modules.lock().unwrap().register(module.clone());
                self.client.send(ClientEvent::Module(proto::ModuleEventBody {
                    reason: "new".to_string(),
                    module: super::module_to_proto(id, &*module),
                }));
            }
            EngineEvent::ModuleUnloaded { module } => self.on_module_unloaded(module),
            EngineEvent::BreakpointBound {
                breakpoint_id,
                line,
            } => self.on_breakpoint_bound(breakpoint_id, line),
            EngineEvent::BreakpointError {
                breakpoint_id,
                message,
            } => self.on_breakpoint_error(breakpoint_id, &message),
            EngineEvent::Output { text } => self.output(OutputCategory::Stdout, text),
            EngineEvent::Message { class, text } => self.on_message(class, text),
        }
    }

    fn on_engine_created(&self) {
        let Some(engine) = self.engine.get() else {
            return;
        };
        let config = self.state.lock().unwrap().config.clone();
        engine.set_metric(
            "JustMyCodeStepping",
            if config.just_my_code { "1" } else { "0" },
        );
        engine.set_metric(
            "EnableStepFiltering",
            if config.enable_step_filtering { "1" } else { "0" },
        );
        engine.set_metric(
            "RequireExactSource",
            if config.require_exact_source { "1" } else { "0" },
        );
    }

    fn on_entry_point(self: &Arc<Self>, thread: &Arc<dyn ThreadRef>) {
        let stop_at_entry = self.state.lock().unwrap().config.stop_at_entry;
        if stop_at_entry {
            self.fire_stopped(thread, StopReason::Step, None, None);
            return;
        }

        // A programmatic continue, not a client-initiated one.
        self.before_continue();
        if let Ok(program) = self.program() {
            weak_error!(program.continue_run(Some(&**thread)), "continue from entry");
        }
    }

    /// A tracepoint silently logs and keeps running -- except when the
    /// preceding client action was a step, in which case the client still
    /// expects a stop, delivered with the step's reason. Preserved as
    /// product behavior.
    fn on_breakpoint_hit(self: &Arc<Self>, thread: &Arc<dyn ThreadRef>, breakpoint_ids: Vec<u32>) {
        let mut all_instruction = !breakpoint_ids.is_empty();
        let mut tracepoints: Vec<Tracepoint> = Vec::new();
        {
            let store = self.breakpoints.lock().unwrap();
            for id in &breakpoint_ids {
                match store.find_by_id(*id) {
                    Some((kind, record)) => {
                        if kind != BreakpointKind::Instruction {
                            all_instruction = false;
                        }
                        if let Some(tracepoint) = &record.tracepoint {
                            tracepoints.push(tracepoint.clone());
                        }
                    }
                    None => {
                        all_instruction = false;
                        log::warn!(target: "events", "hit event for unknown breakpoint {id}");
                    }
                }
            }
        }

        if tracepoints.is_empty() {
            let reason = if all_instruction {
                StopReason::InstructionBreakpoint
            } else {
                StopReason::Breakpoint
            };
            self.fire_stopped(thread, reason, None, Some(breakpoint_ids));
            return;
        }

        // Formatting may evaluate expressions; move it off the callback
        // thread.
        let this = self.clone();
        let log_thread = thread.clone();
        std::thread::spawn(move || {
            let query = PropertyQuery::new(EVALUATION_RADIX, EVALUATION_TIMEOUT_MS);
            let top_frame = log_thread
                .frames(EVALUATION_RADIX)
                .ok()
                .and_then(|frames| frames.first().cloned());

            for tracepoint in tracepoints {
                let message = tracepoint.format(|expression| {
                    let frame = top_frame.as_ref().ok_or_else(|| "no frame".to_string())?;
                    frame
                        .parse_expression(expression)
                        .and_then(|parsed| parsed.evaluate(query))
                        .and_then(|property| property.info(query))
                        .map(|info| info.value)
                        .map_err(|fault| fault.describe().into_owned())
                });
                this.output(OutputCategory::Console, format!("{message}\n"));
            }
        });

        let stepping = self.state.lock().unwrap().stepping;
        if stepping {
            self.fire_stopped(thread, StopReason::Step, None, None);
        } else {
            self.before_continue();
            if let Ok(program) = self.program() {
                weak_error!(
                    program.continue_run(Some(&**thread)),
                    "continue past tracepoint"
                );
            }
        }
    }

    fn on_module_unloaded(&self, module: Arc<dyn Module>) {
        let removed = self.modules.lock().unwrap().deregister(&module);
        match removed {
            Some(id) => {
                self.client.send(ClientEvent::Module(proto::ModuleEventBody {
                    reason: "removed".to_string(),
                    module: super::module_to_proto(id, &*module),
                }));
            }
            None => {
                // Reported, not fatal.
                log::error!(
                    target: "events",
                    "unload event for module '{}' that was never loaded",
                    module.name()
                );
            }
        }
    }

    /// Record the authoritative bind location and re-answer anyone asking
    /// later; last writer wins on the cached result.
    fn on_breakpoint_bound(&self, breakpoint_id: u32, line: Option<u32>) {
        let breakpoint = {
            let mut store = self.breakpoints.lock().unwrap();
            let Some((_, _, record)) = store.find_by_id_mut(breakpoint_id) else {
                log::warn!(target: "events", "bound event for unknown breakpoint {breakpoint_id}");
                return;
            };
            let line = line
                .map(|line| self.engine_line_to_client(line))
                .or(record.requested_line);
            let breakpoint = proto::Breakpoint::bound(record.id, line);
            record.bind_result = Some(breakpoint.clone());
            breakpoint
        };

        self.client
            .send(ClientEvent::Breakpoint(proto::BreakpointEventBody {
                reason: "changed".to_string(),
                breakpoint,
            }));
    }

    fn on_breakpoint_error(&self, breakpoint_id: u32, message: &str) {
        let (breakpoint, console_error) = {
            let mut store = self.breakpoints.lock().unwrap();
            let Some((kind, context, record)) = store.find_by_id_mut(breakpoint_id) else {
                log::warn!(target: "events", "error event for unknown breakpoint {breakpoint_id}");
                return;
            };

            let text = match (kind, &record.fingerprint.condition) {
                (BreakpointKind::Source, Some(condition)) => format!(
                    "The breakpoint condition '{condition}' could not be evaluated: {message}"
                ),
                (BreakpointKind::Function, _) => {
                    format!("Unable to set breakpoint on function '{context}': {message}")
                }
                (BreakpointKind::Data, _) => {
                    format!("Unable to set data breakpoint on '{context}': {message}")
                }
                _ => message.to_string(),
            };

            // The client ignores messages on breakpoint events for some
            // breakpoint kinds; mirror them to the console.
            let console_error = matches!(
                kind,
                BreakpointKind::Function | BreakpointKind::Data
            )
            .then(|| text.clone());

            let breakpoint = proto::Breakpoint::unbound(record.id, record.requested_line, text);
            record.bind_result = Some(breakpoint.clone());
            (breakpoint, console_error)
        };

        if let Some(error) = console_error {
            self.output(OutputCategory::Stderr, format!("Error: {error}\n"));
        }

        self.client
            .send(ClientEvent::Breakpoint(proto::BreakpointEventBody {
                reason: "changed".to_string(),
                breakpoint,
            }));
    }

    fn on_message(&self, class: MessageClass, text: String) {
        match class {
            MessageClass::MessageBox { severity } => {
                if severity != MessageSeverity::None {
                    let mut state = self.state.lock().unwrap();
                    if let Some(slot) = state.launch.as_mut() {
                        if slot.error.is_none() {
                            // First error during a launch: hold it as the
                            // probable launch failure reason.
                            slot.error = Some((severity, text));
                            return;
                        }
                    }
                }
                self.send_message(severity, &text);
            }
            MessageClass::Exception => {
                self.output(OutputCategory::Important, format!("{text}\n"));
            }
            MessageClass::Status => {
                // Plain status text, unless it smells like a diagnostic.
                let lowered = text.to_ascii_lowercase();
                let category = if lowered.starts_with("error:") || lowered.starts_with("warning:") {
                    OutputCategory::Stderr
                } else {
                    OutputCategory::Console
                };
                self.output(category, format!("{text}\n"));
            }
        }
    }

    fn on_program_destroyed(&self, exit_code: i64) {
        let (is_attach, process_name, break_count) = {
            let mut state = self.state.lock().unwrap();
            state.process = None;
            state.program = None;
            (
                state.is_attach,
                state.process_name.clone(),
                state.break_count,
            )
        };

        let message = if is_attach {
            format!("The debugger disconnected from '{process_name}'.\n")
        } else {
            format!("The program '{process_name}' has exited with code {exit_code}.\n")
        };
        self.output(OutputCategory::Console, message);

        log::info!(target: "telemetry", "debug session completed: {break_count} stops");

        self.client.send(ClientEvent::Exited(proto::ExitedEventBody {
            exit_code: if is_attach { 0 } else { exit_code },
        }));
        self.client.send(ClientEvent::Terminated);

        self.terminated.open();
    }
}
