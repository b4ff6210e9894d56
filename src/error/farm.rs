use thiserror::Error;

#[derive(Debug, Error)]
pub enum FarmError {
    #[error("Farm request failed during {context}: {source}")]
    Request {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Farm responded with status {status} during {context}.")]
    Status { context: &'static str, status: u16 },
    #[error("Farm response is missing the session id.")]
    MissingSessionId,
    #[error("Farm response is missing the screenshot payload.")]
    MissingScreenshot,
    #[error("Screenshot payload is not valid base64: {source}")]
    Base64 {
        #[source]
        source: base64::DecodeError,
    },
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Tunnel for farm '{farm}' has no command configured.")]
    MissingTunnelCommand { farm: String },
    #[error("Tunnel '{command}' exited before it was stopped (status {status}).")]
    TunnelExited { command: String, status: String },
    #[error("Browser '{browser}' cannot be launched locally.")]
    NotLaunchable { browser: String },
    #[error("Browser '{browser}' cannot capture screenshots.")]
    ScreenshotUnsupported { browser: String },
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
