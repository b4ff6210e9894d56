use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Request body is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("Request body must be a JSON array of messages.")]
    ExpectedArray,
    #[error("Message {index} is invalid: {source}")]
    InvalidMessage {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Message '{kind}' must not have an empty '{field}'.")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Message '{kind}' is generated by the runner and cannot be sent by an agent.")]
    ReservedKind { kind: &'static str },
    #[error("Unexpected message sequence {actual} (expected: {expected})")]
    UnexpectedSequence { actual: u64, expected: u64 },
    #[error("unsupported message type '{kind}'")]
    UnsupportedMessage { kind: &'static str },
    #[error("Invalid query parameter '{name}': '{value}'")]
    InvalidQuery { name: &'static str, value: String },
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("{message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
