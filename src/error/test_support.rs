use super::{
    ArchiveError, ConfigError, FarmError, MergeError, ProtocolError, RunnerError, ValidationError,
};

impl From<&'static str> for ValidationError {
    fn from(message: &'static str) -> Self {
        ValidationError::TestExpectation { message }
    }
}

impl From<String> for ValidationError {
    fn from(value: String) -> Self {
        ValidationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ProtocolError {
    fn from(message: &'static str) -> Self {
        ProtocolError::TestExpectation { message }
    }
}

impl From<String> for ProtocolError {
    fn from(value: String) -> Self {
        ProtocolError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for RunnerError {
    fn from(message: &'static str) -> Self {
        RunnerError::TestExpectation { message }
    }
}

impl From<String> for RunnerError {
    fn from(value: String) -> Self {
        RunnerError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for FarmError {
    fn from(message: &'static str) -> Self {
        FarmError::TestExpectation { message }
    }
}

impl From<String> for FarmError {
    fn from(value: String) -> Self {
        FarmError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ArchiveError {
    fn from(message: &'static str) -> Self {
        ArchiveError::TestExpectation { message }
    }
}

impl From<String> for ArchiveError {
    fn from(value: String) -> Self {
        ArchiveError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for MergeError {
    fn from(message: &'static str) -> Self {
        MergeError::TestExpectation { message }
    }
}

impl From<String> for MergeError {
    fn from(value: String) -> Self {
        MergeError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
