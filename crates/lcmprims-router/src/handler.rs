use crate::message::ReceivedMessage;

/// Error type returned by handlers. Anything boxable works.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Receives messages for a subscription.
///
/// Handlers run on the dispatching thread, outside the router lock, so they
/// may subscribe or unsubscribe. An `Err` or a panic is logged and counted in
/// the [`DispatchReport`](crate::DispatchReport); it never reaches other
/// handlers.
pub trait Handler: Send + Sync {
    fn handle(&self, message: &ReceivedMessage) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&ReceivedMessage) -> HandlerResult + Send + Sync,
{
    fn handle(&self, message: &ReceivedMessage) -> HandlerResult {
        self(message)
    }
}
