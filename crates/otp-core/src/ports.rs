use async_trait::async_trait;

use crate::domain::OrderId;

/// Why the vendor considers an order dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalReason {
    /// Cancelled by the user or vendor, or already finished.
    Cancelled,
    /// The vendor no longer knows the activation (expired or never existed).
    NotFound,
}

/// One classified answer from the vendor's status endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusReply {
    /// Still waiting for the SMS.
    Pending,
    /// The code arrived. Some vendors echo the phone, most don't.
    CodeReady {
        code: String,
        phone: Option<String>,
    },
    TerminalNegative(TerminalReason),
    /// Network, timeout, rate limit or a response we could not make sense of.
    TransientError { message: String },
}

/// Port for polling an order's status.
///
/// Implementations must be idempotent: calling `query` repeatedly must not
/// change vendor state. Failures are reported as `StatusReply::TransientError`
/// rather than `Err`, so the watcher can count them.
///
/// Vendors that never report a cancelled/expired state simply never return
/// `TerminalNegative`; the watcher then ends only on success or timeout.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    async fn query(&self, order_id: &OrderId) -> StatusReply;
}
