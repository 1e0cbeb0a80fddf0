//! # Chanrpc
//!
//! Multiplexed channel RPC over any duplex message pipe.
//!
//! A `Connection` carries any number of named channels in both directions:
//! each side serves channels from its registry and calls the peer's channels
//! through `ChannelClient`s. Calls are independent futures keyed by request
//! id, cancellable through a `CancellationToken`; events are lazily activated
//! subscriptions. A `Router` serves many clients at once, and `ProxyChannel`
//! turns plain services into channels and back.
//!
//! ## Architecture
//!
//! ```text
//! ServiceProxy -> ClientChannel -> Connection ==frames==> Connection -> ServerChannel -> service
//! ```

pub mod cancel;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod router;

#[cfg(test)]
mod tests;

pub use cancel::CancellationToken;
pub use channel::ClientChannel;
pub use channel::ConnectionId;
pub use channel::Context;
pub use channel::ServerChannel;
pub use connection::ChannelClient;
pub use connection::Connection;
pub use connection::ConnectionBuilder;
pub use error::Error;
pub use error::Result;
pub use event::Emitter;
pub use event::Event;
pub use event::EventStream;
pub use event::Subscription;
pub use protocol::MemoryProtocol;
pub use protocol::Protocol;
pub use protocol::ProtocolError;
pub use proxy::Args;
pub use proxy::ProxyChannel;
pub use proxy::ProxyOptions;
pub use proxy::ServiceProxy;
pub use proxy::ServiceTable;
pub use registry::ChannelRegistry;
pub use router::Client;
pub use router::Router;
