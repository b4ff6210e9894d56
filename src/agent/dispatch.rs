use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveReporter;
use crate::error::{FarmError, ProtocolError};
use crate::protocol::{InboundBody, InboundMessage, LogLevel, MessageKind, OutboundBody};

use super::{Agent, AgentKind};

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// What a handler produced for one inbound message.
pub enum HandlerValue {
    Ready(Value),
    Pending(BoxFuture<'static, Result<Value, String>>),
}

/// A `response` message that becomes available once a handler finishes.
pub type ResponseFuture = BoxFuture<'static, OutboundBody>;

/// Collaborators a handler may need beyond the agent itself.
#[derive(Clone, Default)]
pub struct DispatchContext {
    /// Set when screenshots are enabled and an archive is attached.
    pub screenshots: Option<Arc<ArchiveReporter>>,
}

type Handler = fn(&mut Agent, &InboundBody, &DispatchContext) -> Result<HandlerValue, String>;

const LOCAL_HANDLERS: &[(MessageKind, Handler)] = &[
    (MessageKind::Log, handle_log),
    (MessageKind::Response, handle_response),
    (MessageKind::Screenshot, handle_screenshot),
    (MessageKind::TestRunStarted, handle_run_started),
    (MessageKind::TestRunFinished, handle_run_finished),
];

const SANDBOX_HANDLERS: &[(MessageKind, Handler)] = &[
    (MessageKind::Log, handle_log),
    (MessageKind::Response, handle_response),
    (MessageKind::TestRunStarted, handle_run_started),
    (MessageKind::TestRunFinished, handle_run_finished),
];

impl AgentKind {
    const fn handlers(self) -> &'static [(MessageKind, Handler)] {
        match self {
            AgentKind::Local | AgentKind::Remote => LOCAL_HANDLERS,
            AgentKind::Sandbox => SANDBOX_HANDLERS,
        }
    }
}

/// Kinds an agent itself reacts to. Everything else a browser sends is
/// meant for reporters.
#[must_use]
pub const fn agent_level(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::Log
            | MessageKind::Response
            | MessageKind::Screenshot
            | MessageKind::TestRunStarted
            | MessageKind::TestRunFinished
    )
}

impl Agent {
    /// Runs the handler for `message`.
    ///
    /// When the browser asked for a response, returns a future resolving
    /// to the `response` message (carrying the handler's error, if any).
    /// Otherwise errors are logged and asynchronous work is spawned.
    pub fn dispatch(
        &mut self,
        message: &InboundMessage,
        context: &DispatchContext,
    ) -> Option<ResponseFuture> {
        let kind = message.kind();
        let handler = self
            .kind
            .handlers()
            .iter()
            .find(|(handled, _)| *handled == kind)
            .map(|(_, handler)| *handler);
        let outcome = match handler {
            Some(handler) => handler(self, &message.body, context),
            None if !agent_level(kind) => Ok(HandlerValue::Ready(Value::Null)),
            None => Err(ProtocolError::UnsupportedMessage {
                kind: kind.as_str(),
            }
            .to_string()),
        };

        if message.response_required {
            let response_seq = message.seq;
            let response: ResponseFuture = match outcome {
                Ok(HandlerValue::Ready(value)) => {
                    Box::pin(std::future::ready(response_body(response_seq, Ok(value))))
                }
                Ok(HandlerValue::Pending(pending)) => {
                    Box::pin(async move { response_body(response_seq, pending.await) })
                }
                Err(err) => Box::pin(std::future::ready(response_body(response_seq, Err(err)))),
            };
            return Some(response);
        }

        match outcome {
            Ok(HandlerValue::Ready(_)) => {}
            Ok(HandlerValue::Pending(pending)) => {
                let agent_id = self.id;
                tokio::spawn(async move {
                    if let Err(err) = pending.await {
                        error!(agent = agent_id, %kind, "Handler failed: {}", err);
                    }
                });
            }
            Err(err) => error!(agent = self.id, %kind, "Handler failed: {}", err),
        }
        None
    }
}

fn response_body(response_seq: Option<u64>, result: Result<Value, String>) -> OutboundBody {
    match result {
        Ok(value) => OutboundBody::Response {
            response_seq,
            value,
            error: None,
        },
        Err(err) => OutboundBody::Response {
            response_seq,
            value: Value::Null,
            error: Some(err),
        },
    }
}

fn mismatched(body: &InboundBody) -> String {
    format!("handler cannot process '{}'", body.kind())
}

fn handle_log(
    agent: &mut Agent,
    body: &InboundBody,
    _context: &DispatchContext,
) -> Result<HandlerValue, String> {
    let InboundBody::Log(entry) = body else {
        return Err(mismatched(body));
    };
    match entry.level {
        LogLevel::Debug => debug!(agent = agent.id, "{}", entry.message),
        LogLevel::Info => info!(agent = agent.id, "{}", entry.message),
        LogLevel::Warn => warn!(agent = agent.id, "{}", entry.message),
        LogLevel::Error => error!(agent = agent.id, "{}", entry.message),
    }
    Ok(HandlerValue::Ready(Value::Null))
}

fn handle_response(
    agent: &mut Agent,
    body: &InboundBody,
    _context: &DispatchContext,
) -> Result<HandlerValue, String> {
    let InboundBody::Response(payload) = body else {
        return Err(mismatched(body));
    };
    agent.link.resolve_response(
        payload.response_seq,
        payload.value.clone(),
        payload.error.clone(),
    );
    Ok(HandlerValue::Ready(Value::Null))
}

fn handle_run_started(
    agent: &mut Agent,
    body: &InboundBody,
    _context: &DispatchContext,
) -> Result<HandlerValue, String> {
    let InboundBody::TestRunStarted(_) = body else {
        return Err(mismatched(body));
    };
    agent.is_running = true;
    Ok(HandlerValue::Ready(Value::Null))
}

fn handle_run_finished(
    agent: &mut Agent,
    body: &InboundBody,
    _context: &DispatchContext,
) -> Result<HandlerValue, String> {
    let InboundBody::TestRunFinished(_) = body else {
        return Err(mismatched(body));
    };
    agent.is_running = false;
    if agent.terminate_on_finish {
        agent.terminate();
    }
    Ok(HandlerValue::Ready(Value::Null))
}

fn handle_screenshot(
    agent: &mut Agent,
    body: &InboundBody,
    context: &DispatchContext,
) -> Result<HandlerValue, String> {
    let InboundBody::Screenshot(request) = body else {
        return Err(mismatched(body));
    };
    let (Some(archive), Some(session)) = (context.screenshots.clone(), agent.session.clone())
    else {
        return Ok(HandlerValue::Ready(Value::Null));
    };
    let agent_id = agent.id;
    let name = request.name.clone();
    Ok(HandlerValue::Pending(Box::pin(async move {
        let Some(data) = session.screenshot().await.map_err(|err| err.to_string())? else {
            return Ok(Value::Null);
        };
        let png = decode_png(&data).map_err(|err| err.to_string())?;
        archive
            .save_screenshot(agent_id, &name, png)
            .await
            .map_err(|err| err.to_string())
    })))
}

/// Decodes base64 PNG data, with or without a data-URL header.
///
/// # Errors
///
/// Returns an error when the payload is not valid base64.
pub fn decode_png(data: &str) -> Result<Vec<u8>, FarmError> {
    let payload = data.strip_prefix(PNG_DATA_URL_PREFIX).unwrap_or(data);
    STANDARD
        .decode(payload.trim())
        .map_err(|source| FarmError::Base64 { source })
}
