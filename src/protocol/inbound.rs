use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MessageKind;

/// Opaque id a browser-side framework assigns to a suite or test.
///
/// Only meaningful within one browser connection; accepted as either a JSON
/// string or number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawHashId", into = "String")]
pub struct HashId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawHashId {
    Text(String),
    Number(i64),
}

impl From<RawHashId> for HashId {
    fn from(raw: RawHashId) -> Self {
        match raw {
            RawHashId::Text(text) => HashId(text),
            RawHashId::Number(number) => HashId(number.to_string()),
        }
    }
}

impl From<HashId> for String {
    fn from(id: HashId) -> Self {
        id.0
    }
}

impl std::fmt::Display for HashId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl HashId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        HashId(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response_required: bool,
    #[serde(flatten)]
    pub body: InboundBody,
}

impl InboundMessage {
    #[must_use]
    pub const fn new(body: InboundBody) -> Self {
        Self {
            seq: None,
            response_required: false,
            body,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundBody {
    Log(LogEntry),
    Response(ResponsePayload),
    Screenshot(ScreenshotRequest),
    TestRunStarted(RunMarker),
    TestRunFinished(RunMarker),
    TestSuiteEnter(SuiteEnter),
    TestSuiteLeave(SuiteRef),
    TestSuiteStarted(SuiteRef),
    TestSuiteFinished(SuiteRef),
    TestAdded(TestAdded),
    TestStarted(TestStarted),
    TestFinished(TestFinished),
    CodeCoverage(CoverageReport),
    CodeCoverageStructure(CoverageReport),
}

impl InboundBody {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            InboundBody::Log(_) => MessageKind::Log,
            InboundBody::Response(_) => MessageKind::Response,
            InboundBody::Screenshot(_) => MessageKind::Screenshot,
            InboundBody::TestRunStarted(_) => MessageKind::TestRunStarted,
            InboundBody::TestRunFinished(_) => MessageKind::TestRunFinished,
            InboundBody::TestSuiteEnter(_) => MessageKind::TestSuiteEnter,
            InboundBody::TestSuiteLeave(_) => MessageKind::TestSuiteLeave,
            InboundBody::TestSuiteStarted(_) => MessageKind::TestSuiteStarted,
            InboundBody::TestSuiteFinished(_) => MessageKind::TestSuiteFinished,
            InboundBody::TestAdded(_) => MessageKind::TestAdded,
            InboundBody::TestStarted(_) => MessageKind::TestStarted,
            InboundBody::TestFinished(_) => MessageKind::TestFinished,
            InboundBody::CodeCoverage(_) => MessageKind::CodeCoverage,
            InboundBody::CodeCoverageStructure(_) => MessageKind::CodeCoverageStructure,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub response_seq: u64,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteEnter {
    pub id: HashId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<HashId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAdded {
    pub id: HashId,
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStarted {
    pub id: HashId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFinished {
    pub id: HashId,
    pub passed: bool,
    #[serde(default)]
    pub expectations: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub results: Value,
}
