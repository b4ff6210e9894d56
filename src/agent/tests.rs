use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult, ProtocolError};
use crate::protocol::{InboundMessage, OutboundBody, validate_message};

use super::dispatch::decode_png;
use super::{
    Agent, AgentEvent, AgentKind, AgentLink, DEFAULT_LOST_GRACE, DispatchContext, RemoteState,
};

fn agent(kind: AgentKind) -> (Agent, mpsc::UnboundedReceiver<AgentEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = Arc::new(AgentLink::new(
        7,
        Duration::from_millis(25_000),
        DEFAULT_LOST_GRACE,
        tx,
    ));
    (Agent::new(7, kind, link), rx)
}

fn inbound(value: Value) -> AppResult<InboundMessage> {
    validate_message(0, value).map_err(AppError::from)
}

#[test]
fn sequence_must_increase_by_one() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Local);
    agent.validate_sequence(1)?;
    agent.validate_sequence(2)?;
    match agent.validate_sequence(4) {
        Err(ProtocolError::UnexpectedSequence {
            actual: 4,
            expected: 3,
        }) => {}
        other => {
            return Err(AppError::protocol(format!(
                "Expected sequence error, got {other:?}"
            )));
        }
    }
    agent.validate_sequence(3)?;
    agent.reset_sequence();
    agent.validate_sequence(1)?;
    Ok(())
}

#[test]
fn rejected_sequence_does_not_advance_the_counter() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Local);
    agent.validate_sequence(1)?;
    if agent.validate_sequence(1).is_ok() {
        return Err(AppError::protocol("Duplicate sequence must be rejected"));
    }
    agent.validate_sequence(2)?;
    agent.validate_sequence(3)?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn front_messages_overtake_queued_ones() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Local);
    agent.reload();
    agent.start_test_run(3, None, false, serde_json::Map::new());
    let messages = agent.link().get_messages().await;
    let seqs: Vec<Option<u64>> = messages.iter().map(|message| message.seq).collect();
    if seqs != vec![Some(2), Some(1)] {
        return Err(AppError::protocol(format!("Unexpected order {seqs:?}")));
    }
    if !matches!(
        messages.first().map(|message| &message.body),
        Some(OutboundBody::StartTestRun { run_id: 3, .. })
    ) {
        return Err(AppError::protocol("Expected startTestRun first"));
    }
    if !agent.is_running {
        return Err(AppError::protocol("Expected agent to be running"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn held_poll_is_released_by_a_new_message() -> AppResult<()> {
    let (agent, _events) = agent(AgentKind::Local);
    let link = Arc::clone(agent.link());
    let poll = tokio::spawn(async move { link.get_messages().await });
    tokio::task::yield_now().await;
    agent.link().send_message(OutboundBody::Terminated, false, None);
    let messages = poll.await?;
    if messages.len() != 1 || agent.link().pending_len() != 0 {
        return Err(AppError::protocol(format!(
            "Expected one delivered message, got {messages:?}"
        )));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_poll_times_out_empty() -> AppResult<()> {
    let (agent, _events) = agent(AgentKind::Local);
    let messages = agent.link().get_messages().await;
    if !messages.is_empty() {
        return Err(AppError::protocol("Expected an empty flush"));
    }
    if agent.link().closed_for().is_none() {
        return Err(AppError::protocol("Expected close time to be recorded"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn newer_poll_supersedes_older_one() -> AppResult<()> {
    let (agent, _events) = agent(AgentKind::Local);
    let first_link = Arc::clone(agent.link());
    let first = tokio::spawn(async move { first_link.get_messages().await });
    tokio::task::yield_now().await;
    let second_link = Arc::clone(agent.link());
    let second = tokio::spawn(async move { second_link.get_messages().await });
    tokio::task::yield_now().await;
    if !first.await?.is_empty() {
        return Err(AppError::protocol("Expected superseded poll to be empty"));
    }
    agent.link().send_message(OutboundBody::Terminated, false, None);
    if second.await?.len() != 1 {
        return Err(AppError::protocol("Expected newer poll to deliver"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lost_connection_fires_once_after_grace() -> AppResult<()> {
    let (agent, mut events) = agent(AgentKind::Local);
    agent.link().on_connection_open();
    agent.link().connection_dropped();
    tokio::time::sleep(Duration::from_millis(500)).await;
    if events.try_recv().is_ok() {
        return Err(AppError::protocol("Event fired before grace elapsed"));
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    if events.try_recv() != Ok(AgentEvent::LostConnection { agent_id: 7 }) {
        return Err(AppError::protocol("Expected lost connection event"));
    }

    agent.link().connection_dropped();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    if events.try_recv().is_ok() {
        return Err(AppError::protocol("Lost connection must fire only once"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconnect_within_grace_cancels_timer() -> AppResult<()> {
    let (agent, mut events) = agent(AgentKind::Local);
    agent.link().connection_dropped();
    tokio::time::sleep(Duration::from_millis(200)).await;
    agent.link().on_connection_open();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    if events.try_recv().is_ok() {
        return Err(AppError::protocol("Reconnect should cancel the timer"));
    }

    agent.link().connection_dropped();
    if !agent.link().take_armed_timer() {
        return Err(AppError::protocol("Expected an armed timer"));
    }
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    if events.try_recv().is_ok() {
        return Err(AppError::protocol("Taken timer must not fire"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn response_resolves_registered_callback() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Local);
    let seen: Arc<Mutex<Option<Result<Value, String>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let seq = agent.link().send_message(
        OutboundBody::Reload { forced: false },
        false,
        Some(Box::new(move |result| {
            *sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        })),
    );
    let queued = agent.link().get_messages().await;
    if !queued.first().is_some_and(|message| message.response_required) {
        return Err(AppError::protocol("Expected responseRequired flag"));
    }

    let message = inbound(json!({ "type": "response", "responseSeq": seq, "value": 42 }))?;
    if agent.dispatch(&message, &DispatchContext::default()).is_some() {
        return Err(AppError::protocol("Response needs no reply"));
    }
    let result = seen.lock().unwrap_or_else(PoisonError::into_inner).take();
    if result != Some(Ok(json!(42))) {
        return Err(AppError::protocol(format!("Unexpected callback value {result:?}")));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn sandbox_rejects_screenshots_in_its_response() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Sandbox);
    let message = inbound(json!({
        "type": "screenshot", "name": "home", "seq": 5, "responseRequired": true
    }))?;
    let Some(response) = agent.dispatch(&message, &DispatchContext::default()) else {
        return Err(AppError::protocol("Expected a response future"));
    };
    match response.await {
        OutboundBody::Response {
            response_seq: Some(5),
            error: Some(error),
            ..
        } if error == "unsupported message type 'screenshot'" => Ok(()),
        other => Err(AppError::protocol(format!("Unexpected response {other:?}"))),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn reporter_level_messages_are_acknowledged() -> AppResult<()> {
    let (mut agent, _events) = agent(AgentKind::Remote);
    let message = inbound(json!({
        "type": "testAdded", "id": 3, "name": "adds", "seq": 1, "responseRequired": true
    }))?;
    let Some(response) = agent.dispatch(&message, &DispatchContext::default()) else {
        return Err(AppError::protocol("Expected a response future"));
    };
    match response.await {
        OutboundBody::Response {
            value: Value::Null,
            error: None,
            ..
        } => Ok(()),
        other => Err(AppError::protocol(format!("Unexpected response {other:?}"))),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn finishing_a_run_terminates_when_requested() -> AppResult<()> {
    let (mut agent, mut events) = agent(AgentKind::Remote);
    agent.terminate_on_finish = true;
    agent.remote = Some(RemoteState {
        farm: "grid".to_owned(),
        retries: 0,
        chunk: None,
        url: "http://localhost/".to_owned(),
    });
    agent.is_running = true;
    let message = inbound(json!({ "type": "testRunFinished" }))?;
    if agent.dispatch(&message, &DispatchContext::default()).is_some() {
        return Err(AppError::protocol("No response was requested"));
    }
    if agent.is_running || !agent.link().is_terminated() {
        return Err(AppError::protocol("Expected agent to stop"));
    }
    if events.try_recv() != Ok(AgentEvent::Terminated { agent_id: 7 }) {
        return Err(AppError::protocol("Expected terminated event"));
    }
    Ok(())
}

#[test]
fn png_data_url_header_is_stripped() -> AppResult<()> {
    let plain = decode_png("aGVsbG8=")?;
    let prefixed = decode_png("data:image/png;base64,aGVsbG8=")?;
    if plain != b"hello" || prefixed != b"hello" {
        return Err(AppError::protocol("Unexpected decoded bytes"));
    }
    if decode_png("***").is_ok() {
        return Err(AppError::protocol("Expected invalid base64 to fail"));
    }
    Ok(())
}
