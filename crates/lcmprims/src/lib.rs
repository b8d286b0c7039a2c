//! Lightweight publish/subscribe messaging over UDP multicast.
//!
//! lcmprims moves opaque byte payloads between processes on named channels.
//! Publishers send to a multicast group (or through a TCP relay hub); every
//! subscriber whose pattern matches the channel gets the message. Traffic can be captured to an event
//! log and replayed later.
//!
//! # Crate Structure
//!
//! - [`frame`] — Envelope codec and channel name rules
//! - [`transport`] — Multicast transport with fragmentation and reassembly
//! - [`router`] — Subscription router with glob patterns
//! - [`log`] — Event log writer, reader, player, and recorder
//!
//! [`Lcm`] ties them together behind a provider URL:
//!
//! ```no_run
//! use lcmprims::Lcm;
//!
//! let lcm = Lcm::new("udpm://239.255.76.67:7667?ttl=0")?;
//! lcm.subscribe_fn("robot.*", |msg| {
//!     println!("{} ({} bytes)", msg.channel, msg.payload.len());
//!     Ok(())
//! })?;
//! lcm.publish("robot.pose", b"x=1,y=2")?;
//! lcm.handle()?;
//! # Ok::<(), lcmprims::LcmError>(())
//! ```

pub mod error;
pub mod lcm;
pub mod provider;
pub mod url;

pub use error::{LcmError, Result};
pub use lcm::{Lcm, ReceiverHandle};
pub use provider::{
    LogPlaybackProvider, LogWriterProvider, Provider, Receive, TcpqProvider, UdpmProvider,
};
pub use url::{FileMode, ProviderUrl, DEFAULT_URL, DEFAULT_URL_ENV};

/// Re-export frame types.
pub mod frame {
    pub use lcmprims_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use lcmprims_transport::*;
}

/// Re-export router types.
pub mod router {
    pub use lcmprims_router::*;
}

/// Re-export event log types.
pub mod log {
    pub use lcmprims_log::*;
}
