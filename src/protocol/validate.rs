use serde_json::Value;

use crate::error::ProtocolError;

use super::{InboundBody, InboundMessage, MessageKind};

/// Parses a request body into individually validated messages.
///
/// An empty body is an empty batch. Anything other than a JSON array is
/// rejected as a whole; inside the array each element succeeds or fails on
/// its own.
///
/// # Errors
///
/// Returns an error when the body is not JSON or not an array.
pub fn parse_batch(
    body: &[u8],
) -> Result<Vec<Result<InboundMessage, ProtocolError>>, ProtocolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|source| ProtocolError::InvalidJson { source })?;
    let Value::Array(items) = value else {
        return Err(ProtocolError::ExpectedArray);
    };
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| validate_message(index, item))
        .collect())
}

/// Validates one raw message from a batch.
///
/// # Errors
///
/// Returns an error when the message has an unknown or reserved `type`,
/// is missing required fields, or has empty names.
pub fn validate_message(index: usize, value: Value) -> Result<InboundMessage, ProtocolError> {
    if let Some(kind) = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(MessageKind::runner_generated)
    {
        return Err(ProtocolError::ReservedKind {
            kind: kind.as_str(),
        });
    }
    let message: InboundMessage = serde_json::from_value(value)
        .map_err(|source| ProtocolError::InvalidMessage { index, source })?;
    check_required_names(&message.body)?;
    Ok(message)
}

fn check_required_names(body: &InboundBody) -> Result<(), ProtocolError> {
    let empty = match body {
        InboundBody::TestSuiteEnter(suite) => suite.name.trim().is_empty().then_some("name"),
        InboundBody::TestAdded(test) => test.name.trim().is_empty().then_some("name"),
        InboundBody::Screenshot(shot) => shot.name.trim().is_empty().then_some("name"),
        InboundBody::Log(_)
        | InboundBody::Response(_)
        | InboundBody::TestRunStarted(_)
        | InboundBody::TestRunFinished(_)
        | InboundBody::TestSuiteLeave(_)
        | InboundBody::TestSuiteStarted(_)
        | InboundBody::TestSuiteFinished(_)
        | InboundBody::TestStarted(_)
        | InboundBody::TestFinished(_)
        | InboundBody::CodeCoverage(_)
        | InboundBody::CodeCoverageStructure(_) => None,
    };
    match empty {
        Some(field) => Err(ProtocolError::EmptyField {
            kind: body.kind().as_str(),
            field,
        }),
        None => Ok(()),
    }
}
