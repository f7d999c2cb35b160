//! Chrome DevTools Protocol plumbing: transport, connection, wire types

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{CdpSession, Connection, ListenerId, ProtocolEvent};
pub use transport::{find_chrome, launch_chrome, MessageSink, WebSocketTransport};
