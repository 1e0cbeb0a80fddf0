//! # Channels
//!
//! The two faces of a named channel: the server half that a connection
//! dispatches inbound frames to, and the client half that turns local calls
//! into outbound frames.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chanpack::Value;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::event::Event;

/// Process-wide identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who is calling: passed to every server channel invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// The local connection the request arrived on.
    pub connection: ConnectionId,
    /// The name the peer announced in its `Hello` frame.
    pub peer: String,
}

/// A channel implementation that serves remote callers.
///
/// The same instance may be invoked concurrently from many connections.
#[async_trait::async_trait]
pub trait ServerChannel: Send + Sync + 'static {
    /// Runs `command`. Returning `Error::NotImplemented` or `Error::Canceled`
    /// (inside the `anyhow::Error`) reports that kind to the caller; any other
    /// error reaches the caller as a failure carrying its message.
    async fn call(
        &self,
        ctx: &Context,
        command: &str,
        arg: Value,
        token: CancellationToken,
    ) -> anyhow::Result<Value>;

    /// Returns the event source for `event`, narrowed by `arg` if relevant.
    fn listen(&self, ctx: &Context, event: &str, arg: Value) -> anyhow::Result<Event<Value>>;
}

/// A remote channel as seen by a local caller.
#[async_trait::async_trait]
pub trait ClientChannel: Send + Sync {
    /// Calls `command` on the remote channel.
    ///
    /// Never fails outside the returned future. Dropping the future cancels the call.
    async fn call(&self, command: &str, arg: Value, token: Option<CancellationToken>) -> Result<Value>;

    /// A lazily activated subscription to the remote `event`.
    ///
    /// Failures are silent: if the peer has no such channel or event, it logs
    /// the failure and the event simply never fires. The subscription stays
    /// counted locally until its last listener detaches.
    fn listen(&self, event: &str, arg: Value) -> Event<Value>;
}
