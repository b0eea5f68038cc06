//! The webmention engine: receive-side verification and entry synthesis,
//! send-side discovery and delivery, vouch-based trust, and salmention
//! re-propagation.
//!
//! https://www.w3.org/TR/webmention/

use std::fmt;

mod linkback;
pub mod receive;
pub mod send;
mod vouch;

pub use linkback::find_in_json;
pub use linkback::links_back;
pub use linkback::RemoteDocument;
pub use receive::process_webmention;
pub use receive::verify_request;
pub use send::send_salmention;
pub use send::send_webmentions;
pub use send::WebmentionSender;

/// Status of a webmention, incoming or outgoing. Every transition is
/// persisted before the next step of a workflow runs, so a restart finds
/// each row in a consistent state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebmentionStatus {
    // generic
    Processing,
    Success,
    Failure,

    // for incoming only:
    Received,
    PendingModeration,

    // for outgoing only:
    NoEndpoint,
}

impl WebmentionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Received => "received",
            Self::PendingModeration => "pending_moderation",
            Self::NoEndpoint => "no_endpoint",
        }
    }

}

impl fmt::Display for WebmentionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
