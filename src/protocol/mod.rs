//! Wire types for the long-poll exchange between browsers and the runner.
//!
//! Inbound messages arrive as a JSON array; every element carries a `type`
//! tag and is validated on its own so one malformed entry never drops the
//! rest of the batch. Outbound messages are what an agent's outbox holds.
mod inbound;
mod kind;
mod outbound;
mod validate;

#[cfg(test)]
mod tests;

pub use inbound::{
    CoverageReport, HashId, InboundBody, InboundMessage, LogEntry, LogLevel, ResponsePayload,
    RunMarker, ScreenshotRequest, SuiteEnter, SuiteRef, TestAdded, TestFinished, TestStarted,
};
pub use kind::MessageKind;
pub use outbound::{OutboundBody, OutboundMessage, RedirectTarget};
pub use validate::{parse_batch, validate_message};
