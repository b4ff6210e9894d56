use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub response_required: bool,
    #[serde(flatten)]
    pub body: OutboundBody,
}

impl From<OutboundBody> for OutboundMessage {
    fn from(body: OutboundBody) -> Self {
        Self {
            seq: None,
            response_required: false,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundBody {
    Handshake {
        agent_id: u64,
        proxy_id: String,
    },
    Error {
        message: String,
    },
    StartTestRun {
        run_id: u64,
        reload: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        test_ids: Option<Vec<String>>,
        #[serde(default)]
        test_options: Map<String, Value>,
    },
    Reload {
        forced: bool,
    },
    Redirect(RedirectTarget),
    Terminated,
    Response {
        response_seq: Option<u64>,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundBody {
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            OutboundBody::Handshake { .. } => "handshake",
            OutboundBody::Error { .. } => "error",
            OutboundBody::StartTestRun { .. } => "startTestRun",
            OutboundBody::Reload { .. } => "reload",
            OutboundBody::Redirect(_) => "redirect",
            OutboundBody::Terminated => "terminated",
            OutboundBody::Response { .. } => "response",
        }
    }
}

/// Where a redirected browser should navigate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

impl RedirectTarget {
    pub const BLANK: &'static str = "about:blank";

    #[must_use]
    pub fn blank() -> Self {
        Self {
            url: Some(Self::BLANK.to_owned()),
            port: None,
            page: None,
        }
    }

    #[must_use]
    pub const fn port(port: u16) -> Self {
        Self {
            url: None,
            port: Some(port),
            page: None,
        }
    }

    #[must_use]
    pub fn page(port: u16, page: impl Into<String>) -> Self {
        Self {
            url: None,
            port: Some(port),
            page: Some(page.into()),
        }
    }
}
