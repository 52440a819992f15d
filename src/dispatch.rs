//! Request decode/dispatch loop: one decoded request at a time is handed
//! to the session and answered before the next one is read. Events from
//! the session (any thread) interleave with responses through the shared
//! writer.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::proto::{self, ClientEvent};
use crate::session::{ClientSink, Error, Session};
use crate::transport::{write_message, FramedReader};

/// Serializing writer shared between the response path and asynchronous
/// event senders.
pub struct ClientWriter {
    writer: Mutex<Box<dyn Write + Send>>,
    seq: AtomicI64,
}

impl ClientWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(ClientWriter {
            writer: Mutex::new(writer),
            seq: AtomicI64::new(0),
        })
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn respond(&self, request: &proto::Request, result: Result<Option<Value>, Error>) {
        let response = match result {
            Ok(body) => proto::Response {
                seq: self.next_seq(),
                kind: "response",
                request_seq: request.seq,
                success: true,
                command: request.command.clone(),
                message: None,
                body,
            },
            Err(error) => {
                log::debug!(target: "transport", "{} failed: {error:#}", request.command);
                let body = serde_json::to_value(proto::ErrorResponseBody {
                    error: proto::Message {
                        id: error.id(),
                        format: error.to_string(),
                    },
                })
                .ok();
                proto::Response {
                    seq: self.next_seq(),
                    kind: "response",
                    request_seq: request.seq,
                    success: false,
                    command: request.command.clone(),
                    message: Some(error.to_string()),
                    body,
                }
            }
        };

        let mut writer = self.writer.lock().unwrap();
        if let Err(error) = write_message(&mut *writer, &response) {
            log::error!(target: "transport", "failed to write response: {error:#}");
        }
    }
}

impl ClientSink for ClientWriter {
    fn send(&self, event: ClientEvent) {
        let envelope = proto::EventEnvelope {
            seq: self.next_seq(),
            kind: "event",
            event: event.name(),
            body: event.body(),
        };

        let mut writer = self.writer.lock().unwrap();
        if let Err(error) = write_message(&mut *writer, &envelope) {
            log::error!(target: "transport", "failed to write event: {error:#}");
        }
    }
}

fn parse<T: DeserializeOwned>(arguments: &Value) -> Result<T, Error> {
    // Requests without arguments arrive as null; decode them as {}.
    let value = if arguments.is_null() {
        Value::Object(Default::default())
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|error| Error::InvalidArguments(error.to_string()))
}

fn body<T: serde::Serialize>(value: T) -> Result<Option<Value>, Error> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|error| Error::InvalidArguments(error.to_string()))
}

fn handle(session: &Arc<Session>, request: &proto::Request) -> Result<Option<Value>, Error> {
    let arguments = &request.arguments;
    match request.command.as_str() {
        "initialize" => body(session.initialize(parse(arguments)?)?),
        "launch" => session.launch(parse(arguments)?).map(|_| None),
        "attach" => session.attach(parse(arguments)?).map(|_| None),
        "configurationDone" => session.configuration_done().map(|_| None),
        "disconnect" => session.disconnect(parse(arguments)?).map(|_| None),
        "continue" => {
            let args: proto::ContinueArgs = parse(arguments)?;
            body(session.continue_request(args.thread_id)?)
        }
        "next" => step(session, arguments, crate::engine::StepKind::Over),
        "stepIn" => step(session, arguments, crate::engine::StepKind::Into),
        "stepOut" => step(session, arguments, crate::engine::StepKind::Out),
        "pause" => session.pause(parse(arguments)?).map(|_| None),
        "threads" => body(session.threads()?),
        "modules" => body(session.modules()?),
        "stackTrace" => body(session.stack_trace(parse(arguments)?)?),
        "scopes" => body(session.scopes(parse(arguments)?)?),
        "variables" => body(session.variables(parse(arguments)?)?),
        "setVariable" => body(session.set_variable(parse(arguments)?)?),
        "evaluate" => body(session.evaluate(parse(arguments)?)?),
        "completions" => body(session.completions(parse(arguments)?)?),
        "setBreakpoints" => body(session.set_breakpoints(parse(arguments)?)),
        "setFunctionBreakpoints" => body(session.set_function_breakpoints(parse(arguments)?)),
        "setInstructionBreakpoints" => body(session.set_instruction_breakpoints(parse(arguments)?)),
        "setDataBreakpoints" => body(session.set_data_breakpoints(parse(arguments)?)),
        "dataBreakpointInfo" => body(session.data_breakpoint_info(parse(arguments)?)?),
        "setExceptionBreakpoints" => session
            .set_exception_breakpoints(parse(arguments)?)
            .map(|_| None),
        "gotoTargets" => body(session.goto_targets(parse(arguments)?)?),
        "goto" => session.goto(parse(arguments)?).map(|_| None),
        "readMemory" => body(session.read_memory(parse(arguments)?)?),
        "disassemble" => body(session.disassemble(parse(arguments)?)?),
        other => Err(Error::UnsupportedCommand(other.to_string())),
    }
}

fn step(
    session: &Arc<Session>,
    arguments: &Value,
    kind: crate::engine::StepKind,
) -> Result<Option<Value>, Error> {
    let args: proto::StepArgs = parse(arguments)?;
    let granularity = crate::engine::StepGranularity::parse(args.granularity.as_deref());
    session.step(args.thread_id, kind, granularity).map(|_| None)
}

/// Run the session loop until the client disconnects or the stream dies.
pub fn serve<R: BufRead>(
    mut reader: FramedReader<R>,
    writer: Arc<ClientWriter>,
    session: Arc<Session>,
) -> anyhow::Result<()> {
    loop {
        let value = reader.read_message()?;
        let request: proto::Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(error) => {
                log::warn!(target: "transport", "discarding malformed request: {error:#}");
                continue;
            }
        };

        log::debug!(target: "transport", "{}: {}", request.seq, request.command);

        let is_disconnect = request.command == "disconnect";
        let result = handle(&session, &request);
        writer.respond(&request, result);

        if is_disconnect {
            return Ok(());
        }
    }
}
