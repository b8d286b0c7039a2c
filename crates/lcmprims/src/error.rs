use lcmprims_log::LogError;
use lcmprims_router::RouterError;
use lcmprims_transport::TransportError;

/// Errors returned by [`Lcm`](crate::Lcm) and its providers.
#[derive(Debug, thiserror::Error)]
pub enum LcmError {
    /// The provider URL cannot be used.
    #[error("invalid provider url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Subscription error.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// Event log error.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The provider cannot perform this operation.
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),

    /// A playback provider reached the end of its log.
    #[error("no more messages: end of log")]
    Exhausted,

    /// The context has been closed.
    #[error("lcm closed")]
    Closed,
}

impl LcmError {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Transport errors, with `Closed` lifted to [`LcmError::Closed`].
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LcmError>;
