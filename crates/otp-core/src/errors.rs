/// Core error type for the OTP bot.
///
/// Adapter crates should map their specific errors into this type so the core
/// can decide what is retryable and what the user gets to see.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    /// Network failure, timeout, rate limit or 5xx. May succeed on a later try.
    #[error("transient error: {0}")]
    Transient(String),

    /// The vendor answered with one of its error tokens (`NO_BALANCE`, `BAD_KEY`, ...).
    #[error("vendor rejected request: {code}")]
    Vendor { code: String },

    #[error("requester {requester} already has a pending order {order_id}")]
    OrderInProgress { requester: i64, order_id: String },

    #[error("order {order_id} is already {from}, cannot become {to}")]
    InvalidTransition {
        order_id: String,
        from: &'static str,
        to: &'static str,
    },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
