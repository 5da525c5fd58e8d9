//! Supervised FCM connections.
//!
//! A [`Supervisor`] keeps a registry of [`Connection`]s, opens a replacement
//! whenever FCM announces it is draining one, and fans outbound messages
//! out to whatever is live. Transports plug in through [`Connector`]; the
//! production one is [`XmppConnector`], tests use [`memory::MemoryConnector`].

mod config;
mod connection;
mod error;
pub mod framing;
pub mod memory;
mod sink;
mod supervisor;
mod transport;
mod xmpp;

pub use config::{XmppConfig, FCM_DEV_PORT, FCM_DOMAIN, FCM_HOST, FCM_PROD_PORT};
pub use connection::{Connection, ConnectionLink, InboundSink, SignalSink, StateCell};
pub use error::{
    ClientError, ClientErrorKind, ConfigError, HandshakeError, SupervisorError, TransportError,
};
pub use sink::{ErrorReport, ErrorSink, Severity};
pub use supervisor::{
    ConnectionSummary, FanOutMode, Supervisor, SupervisorConfig, SupervisorHandle,
};
pub use transport::{Connector, FrameSink, FrameSource};
pub use xmpp::{XmppConnector, XmppSink, XmppSource};
