use std::fmt;

/// Every message kind that can flow through the reporter stream.
///
/// The first group is accepted from browsers; the second is generated by the
/// runner itself and rejected when a browser tries to send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Log,
    Response,
    Screenshot,
    TestRunStarted,
    TestRunFinished,
    TestSuiteEnter,
    TestSuiteLeave,
    TestSuiteStarted,
    TestSuiteFinished,
    TestAdded,
    TestStarted,
    TestFinished,
    CodeCoverage,
    CodeCoverageStructure,
    AgentAdded,
    AgentRegistered,
    AgentLostConnection,
    AgentTerminated,
    AgentFailed,
    AgentLaunched,
    RunStarted,
    SystemError,
}

impl MessageKind {
    pub const RUNNER_GENERATED: [MessageKind; 8] = [
        MessageKind::AgentAdded,
        MessageKind::AgentRegistered,
        MessageKind::AgentLostConnection,
        MessageKind::AgentTerminated,
        MessageKind::AgentFailed,
        MessageKind::AgentLaunched,
        MessageKind::RunStarted,
        MessageKind::SystemError,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Log => "log",
            MessageKind::Response => "response",
            MessageKind::Screenshot => "screenshot",
            MessageKind::TestRunStarted => "testRunStarted",
            MessageKind::TestRunFinished => "testRunFinished",
            MessageKind::TestSuiteEnter => "testSuiteEnter",
            MessageKind::TestSuiteLeave => "testSuiteLeave",
            MessageKind::TestSuiteStarted => "testSuiteStarted",
            MessageKind::TestSuiteFinished => "testSuiteFinished",
            MessageKind::TestAdded => "testAdded",
            MessageKind::TestStarted => "testStarted",
            MessageKind::TestFinished => "testFinished",
            MessageKind::CodeCoverage => "codeCoverage",
            MessageKind::CodeCoverageStructure => "codeCoverageStructure",
            MessageKind::AgentAdded => "agentAdded",
            MessageKind::AgentRegistered => "agentRegistered",
            MessageKind::AgentLostConnection => "agentLostConnection",
            MessageKind::AgentTerminated => "agentTerminated",
            MessageKind::AgentFailed => "agentFailed",
            MessageKind::AgentLaunched => "agentLaunched",
            MessageKind::RunStarted => "runStarted",
            MessageKind::SystemError => "systemError",
        }
    }

    /// Looks up a runner-generated kind by its wire name.
    #[must_use]
    pub fn runner_generated(name: &str) -> Option<MessageKind> {
        Self::RUNNER_GENERATED
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
