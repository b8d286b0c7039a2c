/// Errors that can occur in routing operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The subscription pattern cannot be parsed.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    /// The subscription table lock was poisoned by a panicking thread.
    #[error("subscription table poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, RouterError>;
