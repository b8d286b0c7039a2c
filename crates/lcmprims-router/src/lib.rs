//! Channel subscription router for lcmprims.
//!
//! Handlers subscribe to an exact channel name or a glob pattern in which
//! `*` stands for whole dot-separated tokens. [`Router::dispatch`] invokes
//! every matching handler in registration order and contains handler
//! failures so one bad subscriber cannot starve the rest.

pub mod error;
pub mod handler;
pub mod message;
pub mod pattern;
pub mod router;

pub use error::{Result, RouterError};
pub use handler::{Handler, HandlerError, HandlerResult};
pub use message::{now_utime, ReceivedMessage};
pub use pattern::{ChannelPattern, MatchConfig, WildcardMode};
pub use router::{DispatchReport, Router, RouterConfig, SubscriptionHandle};
