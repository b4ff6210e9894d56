use serde_json::json;

use crate::error::{AppError, AppResult, ProtocolError};

use super::{
    HashId, InboundBody, OutboundBody, OutboundMessage, RedirectTarget, parse_batch,
    validate_message,
};

#[test]
fn batch_keeps_valid_messages_next_to_invalid_ones() -> AppResult<()> {
    let body = json!([
        {"type": "testAdded", "id": 7, "name": "adds"},
        {"type": "testAdded", "id": 8},
        {"type": "bogus"},
        {"type": "testFinished", "id": "x1", "passed": false, "seq": 3}
    ]);
    let results = parse_batch(body.to_string().as_bytes())?;
    if results.len() != 4 {
        return Err(AppError::protocol("Expected one result per array element"));
    }
    let valid: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    if valid.len() != 2 {
        return Err(AppError::protocol(format!(
            "Expected 2 valid messages, got {}",
            valid.len()
        )));
    }
    match valid.first().map(|message| &message.body) {
        Some(InboundBody::TestAdded(test)) if test.id == HashId::new("7") => {}
        other => {
            return Err(AppError::protocol(format!(
                "Unexpected first message: {other:?}"
            )));
        }
    }
    if valid.get(1).and_then(|message| message.seq) != Some(3) {
        return Err(AppError::protocol("Expected seq to survive flattening"));
    }
    Ok(())
}

#[test]
fn non_array_body_is_rejected() -> AppResult<()> {
    match parse_batch(br#"{"type":"log","message":"x"}"#) {
        Err(ProtocolError::ExpectedArray) => Ok(()),
        other => Err(AppError::protocol(format!(
            "Expected ExpectedArray, got {other:?}"
        ))),
    }
}

#[test]
fn empty_body_is_an_empty_batch() -> AppResult<()> {
    if !parse_batch(b"  ")?.is_empty() {
        return Err(AppError::protocol("Expected blank body to parse as empty"));
    }
    Ok(())
}

#[test]
fn runner_generated_kinds_are_reserved() -> AppResult<()> {
    match validate_message(0, json!({"type": "agentAdded"})) {
        Err(ProtocolError::ReservedKind { kind: "agentAdded" }) => Ok(()),
        other => Err(AppError::protocol(format!(
            "Expected ReservedKind, got {other:?}"
        ))),
    }
}

#[test]
fn empty_suite_name_is_rejected() -> AppResult<()> {
    match validate_message(0, json!({"type": "testSuiteEnter", "id": 1, "name": " "})) {
        Err(ProtocolError::EmptyField { field: "name", .. }) => Ok(()),
        other => Err(AppError::protocol(format!(
            "Expected EmptyField, got {other:?}"
        ))),
    }
}

#[test]
fn outbound_messages_use_camel_case_wire_names() -> AppResult<()> {
    let message = OutboundMessage {
        seq: Some(4),
        response_required: true,
        body: OutboundBody::StartTestRun {
            run_id: 2,
            reload: false,
            test_ids: None,
            test_options: serde_json::Map::new(),
        },
    };
    let value = serde_json::to_value(&message)?;
    let expected = json!({
        "seq": 4,
        "responseRequired": true,
        "type": "startTestRun",
        "runId": 2,
        "reload": false,
        "testOptions": {}
    });
    if value != expected {
        return Err(AppError::protocol(format!("Unexpected wire form: {value}")));
    }

    let redirect = serde_json::to_value(OutboundMessage::from(OutboundBody::Redirect(
        RedirectTarget::blank(),
    )))?;
    if redirect != json!({"type": "redirect", "url": "about:blank"}) {
        return Err(AppError::protocol(format!(
            "Unexpected redirect form: {redirect}"
        )));
    }
    Ok(())
}
