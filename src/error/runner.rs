use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("No test files to run.")]
    NoTestFiles,
    #[error("Unknown browser '{name}'.")]
    UnknownBrowser { name: String },
    #[error("Runner has been destroyed.")]
    Destroyed,
    #[error("timed out waiting for agent to register")]
    RegisterTimeout,
    #[error("Message queue closed before the batch was processed.")]
    QueueClosed,
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
