//! # Connection
//!
//! Multiplexes named channels over one `Protocol`, in both directions.
//!
//! Every connection runs two background tasks: a writer draining an
//! unbounded outbound queue, and a reader dispatching inbound frames in
//! order. Inbound calls each run on their own task so a slow callee does not
//! hold up later frames.
//!
//! ## Invariants
//! - **One-Shot Settle**: a pending call is removed from the map by whoever
//!   settles it first (reply, local cancel, close); later replies miss and are ignored.
//! - **Corruption Isolation**: an undecodable frame fails at most the one call it names.
//! - **Single Close**: reader end, writer failure and `dispose` all funnel into one close path.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use chanpack::MarshalRegistry;
use chanpack::Value;
use chanwire::ErrorKind;
use chanwire::Frame;
use chanwire::FrameKind;

use crate::cancel::CancellationToken;
use crate::channel::ClientChannel;
use crate::channel::ConnectionId;
use crate::channel::Context;
use crate::channel::ServerChannel;
use crate::error::Error;
use crate::error::Result;
use crate::error::classify;
use crate::event::Emitter;
use crate::event::Event;
use crate::event::Subscription;
use crate::protocol::Protocol;
use crate::registry::ChannelRegistry;

/// How long an inbound call waits for its channel to be registered.
pub const DEFAULT_UNKNOWN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(1);

type Reply = oneshot::Sender<Result<Value>>;

struct Inner {
    id: ConnectionId,
    name: String,
    protocol: Arc<dyn Protocol>,
    registry: ChannelRegistry,
    marshal: MarshalRegistry,
    unknown_channel_timeout: Duration,

    outbound: mpsc::UnboundedSender<Vec<u8>>,
    request_ids: AtomicU64,
    subscription_ids: AtomicU64,

    /// Outbound calls awaiting a reply.
    pending: DashMap<u64, Reply>,
    /// Outbound subscriptions, keyed by subscription id.
    subscriptions: DashMap<u64, Emitter<Value>>,
    /// Inbound calls still running.
    active_calls: DashMap<u64, CancellationToken>,
    /// Inbound subscriptions forwarding `Fire` frames. `None` while the
    /// channel has not been registered yet.
    active_listens: DashMap<u64, Option<Subscription>>,

    peer: watch::Sender<Option<String>>,
    closing: AtomicBool,
    closed: CancellationToken,
    on_did_close: Emitter<()>,
}

/// One multiplexed session over a duplex message pipe.
///
/// Cheap to clone; all clones share the session. Background tasks keep the
/// session alive until the pipe closes or `dispose` is called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Fluent configuration for a `Connection`.
pub struct ConnectionBuilder {
    protocol: Arc<dyn Protocol>,
    name: String,
    registry: Option<ChannelRegistry>,
    marshal: MarshalRegistry,
    unknown_channel_timeout: Duration,
}

impl ConnectionBuilder {
    /// The context name announced to the peer.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Serve channels from a shared registry instead of a private one.
    pub fn registry(mut self, registry: ChannelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Types revived when decoding marshalled values.
    pub fn marshal_registry(mut self, marshal: MarshalRegistry) -> Self {
        self.marshal = marshal;
        self
    }

    pub fn unknown_channel_timeout(mut self, timeout: Duration) -> Self {
        self.unknown_channel_timeout = timeout;
        self
    }

    /// Starts the connection. Must be called within a tokio runtime.
    pub fn build(self) -> Connection {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (peer, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            id: ConnectionId::next(),
            name: self.name,
            protocol: self.protocol,
            registry: self.registry.unwrap_or_default(),
            marshal: self.marshal,
            unknown_channel_timeout: self.unknown_channel_timeout,
            outbound,
            request_ids: AtomicU64::new(1),
            subscription_ids: AtomicU64::new(1),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            active_calls: DashMap::new(),
            active_listens: DashMap::new(),
            peer,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            on_did_close: Emitter::new(),
        });

        tracing::debug!(conn = %inner.id, name = %inner.name, "connection opened");
        inner.send_frame(&Frame::Hello { ctx: inner.name.clone() });

        tokio::spawn(Inner::write_loop(inner.clone(), outbound_rx));
        tokio::spawn(Inner::read_loop(inner.clone()));

        Connection { inner }
    }
}

impl Connection {
    pub fn builder(protocol: impl Protocol) -> ConnectionBuilder {
        ConnectionBuilder {
            protocol: Arc::new(protocol),
            name: String::new(),
            registry: None,
            marshal: MarshalRegistry::default(),
            unknown_channel_timeout: DEFAULT_UNKNOWN_CHANNEL_TIMEOUT,
        }
    }

    /// A connection with default settings announcing `name`.
    pub fn new(protocol: impl Protocol, name: impl Into<String>) -> Self {
        Self::builder(protocol).name(name).build()
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The client half of the peer's channel `name`.
    pub fn channel(&self, name: impl Into<String>) -> ChannelClient {
        ChannelClient { inner: self.inner.clone(), name: name.into() }
    }

    /// Serves `channel` to the peer under `name`.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        self.inner.registry.register(name, channel);
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    /// The peer's announced name, once its `Hello` has arrived.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.peer.borrow().clone()
    }

    /// Waits for the peer's `Hello`. `None` if the connection closes first.
    pub async fn wait_for_peer(&self) -> Option<String> {
        let mut rx = self.inner.peer.subscribe();
        tokio::select! {
            peer = rx.wait_for(Option::is_some) => peer.ok().and_then(|p| (*p).clone()),
            _ = self.inner.closed.cancelled() => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Fires once, after the connection has closed and released its state.
    pub fn on_did_close(&self) -> Event<()> {
        self.inner.on_did_close.event()
    }

    /// Closes the connection: outstanding calls reject with `ConnectionClosed`,
    /// subscriptions end, inbound calls are cancelled. Idempotent.
    pub fn dispose(&self) {
        self.inner.close("disposed");
    }

    /// Outbound calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Outbound subscriptions currently active on the peer.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl Inner {
    fn send_frame(&self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => self.enqueue(bytes),
            Err(e) => tracing::warn!(conn = %self.id, kind = ?frame.kind(), error = %e, "failed to encode frame"),
        }
    }

    fn enqueue(&self, bytes: Vec<u8>) {
        // The writer only stops once the connection is closed.
        let _ = self.outbound.send(bytes);
    }

    async fn write_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            let bytes = tokio::select! {
                biased;
                bytes = rx.recv() => match bytes {
                    Some(bytes) => bytes,
                    None => break,
                },
                _ = inner.closed.cancelled() => break,
            };
            if let Err(e) = inner.protocol.send(&bytes).await {
                tracing::debug!(conn = %inner.id, error = %e, "send failed");
                inner.close("send failed");
                break;
            }
        }
    }

    async fn read_loop(inner: Arc<Inner>) {
        let reason = loop {
            let msg = tokio::select! {
                msg = inner.protocol.recv() => msg,
                _ = inner.closed.cancelled() => return,
            };
            match msg {
                Ok(Some(bytes)) => inner.handle_message(&bytes),
                Ok(None) => break "peer closed",
                Err(e) => {
                    tracing::warn!(conn = %inner.id, error = %e, "receive failed");
                    break "receive failed";
                }
            }
        };
        inner.close(reason);
    }

    fn handle_message(self: &Arc<Self>, bytes: &[u8]) {
        let frame = match Frame::decode(bytes, &self.marshal) {
            Ok(frame) => frame,
            Err(e) => return self.handle_corrupt(bytes, e),
        };
        tracing::trace!(conn = %self.id, kind = ?frame.kind(), id = ?frame.id(), "frame received");

        match frame {
            Frame::Hello { ctx } => {
                self.peer.send_replace(Some(ctx));
            }
            Frame::Call { id, channel, command, arg } => self.start_call(id, channel, command, arg),
            Frame::CallOk { id, value } => self.settle(id, Ok(value)),
            Frame::CallErr { id, kind, message } => self.settle(id, Err(Error::from_wire(kind, message))),
            Frame::Cancel { id } => {
                if let Some(token) = self.active_calls.get(&id).map(|t| t.value().clone()) {
                    tracing::debug!(conn = %self.id, id, "inbound call cancelled by peer");
                    token.cancel();
                }
            }
            Frame::Listen { id, channel, event, arg } => self.start_listen(id, channel, event, arg),
            Frame::Fire { id, value } => {
                // Clone out so listeners run without holding the map shard.
                let emitter = self.subscriptions.get(&id).map(|e| e.value().clone());
                match emitter {
                    Some(emitter) => emitter.fire(value),
                    None => tracing::debug!(conn = %self.id, id, "event for unknown subscription"),
                }
            }
            Frame::Dispose { id } => {
                let forwarder = self.active_listens.remove(&id);
                drop(forwarder);
            }
        }
    }

    /// Drops an undecodable frame, failing the one request it can be routed to.
    fn handle_corrupt(&self, bytes: &[u8], error: chanwire::Error) {
        tracing::warn!(conn = %self.id, error = %error, len = bytes.len(), "dropping corrupt frame");
        match chanwire::decode_header(bytes) {
            Ok((FrameKind::Call, Some(id))) => self.send_frame(&Frame::CallErr {
                id,
                kind: ErrorKind::Failure,
                message: format!("corrupt call frame: {}", error),
            }),
            Ok((FrameKind::CallOk | FrameKind::CallErr, Some(id))) => {
                self.settle(id, Err(Error::CorruptFrame(error)));
            }
            _ => {}
        }
    }

    fn settle(&self, id: u64, result: Result<Value>) {
        match self.pending.remove(&id) {
            Some((_, reply)) => {
                let _ = reply.send(result);
            }
            None => tracing::debug!(conn = %self.id, id, "ignoring reply for settled call"),
        }
    }

    fn context(&self) -> Context {
        Context {
            connection: self.id,
            peer: self.peer.borrow().clone().unwrap_or_default(),
        }
    }

    fn start_call(self: &Arc<Self>, id: u64, channel: String, command: String, arg: Value) {
        let token = CancellationToken::new();
        self.active_calls.insert(id, token.clone());

        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.invoke(&channel, &command, arg, token).await;
            inner.active_calls.remove(&id);
            if inner.closed.is_cancelled() {
                return;
            }

            let frame = match result {
                Ok(value) => Frame::CallOk { id, value },
                Err(err) => {
                    let (kind, message) = classify(&err);
                    tracing::debug!(conn = %inner.id, id, %channel, %command, ?kind, "call failed");
                    Frame::CallErr { id, kind, message }
                }
            };
            inner.send_frame(&frame);
        });
    }

    async fn invoke(
        &self,
        name: &str,
        command: &str,
        arg: Value,
        token: CancellationToken,
    ) -> anyhow::Result<Value> {
        let channel = tokio::select! {
            channel = self.registry.wait_for(name, self.unknown_channel_timeout) => channel,
            _ = token.cancelled() => return Err(Error::Canceled.into()),
        };
        let Some(channel) = channel else {
            return Err(Error::NotImplemented(format!("channel '{}'", name)).into());
        };
        channel.call(&self.context(), command, arg, token).await
    }

    fn start_listen(self: &Arc<Self>, id: u64, name: String, event: String, arg: Value) {
        if let Some(channel) = self.registry.get(&name) {
            if let Some(forwarder) = self.forward(id, channel.as_ref(), &name, &event, arg) {
                self.active_listens.insert(id, Some(forwarder));
            }
            return;
        }

        // Reserve the id so a `Dispose` during the wait withdraws it.
        self.active_listens.insert(id, None);
        let inner = self.clone();
        tokio::spawn(async move {
            let channel = tokio::select! {
                channel = inner.registry.wait_for(&name, inner.unknown_channel_timeout) => channel,
                _ = inner.closed.cancelled() => return,
            };
            let Some(channel) = channel else {
                tracing::warn!(conn = %inner.id, id, channel = %name, %event, "listen on unknown channel");
                inner.active_listens.remove(&id);
                return;
            };
            let Some(forwarder) = inner.forward(id, channel.as_ref(), &name, &event, arg) else {
                inner.active_listens.remove(&id);
                return;
            };

            // The shard lock orders this against a concurrent `Dispose` or close.
            let rejected = match inner.active_listens.get_mut(&id) {
                Some(mut slot) => {
                    *slot = Some(forwarder);
                    None
                }
                None => Some(forwarder),
            };
            if let Some(forwarder) = rejected {
                tracing::debug!(conn = %inner.id, id, "subscription disposed before its channel appeared");
                drop(forwarder);
            }
        });
    }

    /// Attaches a listener that writes `Fire{id}` frames for every value of `event`.
    fn forward(
        self: &Arc<Self>,
        id: u64,
        channel: &dyn ServerChannel,
        name: &str,
        event: &str,
        arg: Value,
    ) -> Option<Subscription> {
        let source = match channel.listen(&self.context(), event, arg) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(conn = %self.id, id, channel = %name, %event, error = %e, "listen failed");
                return None;
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        Some(source.on(move |value: &Value| {
            if let Some(inner) = weak.upgrade() {
                inner.send_frame(&Frame::Fire { id, value: value.clone() });
            }
        }))
    }

    fn close(&self, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        tracing::debug!(conn = %self.id, name = %self.name, reason, "connection closed");

        for id in keys(&self.pending) {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        for id in keys(&self.subscriptions) {
            if let Some((_, emitter)) = self.subscriptions.remove(&id) {
                emitter.dispose();
            }
        }
        for id in keys(&self.active_calls) {
            if let Some((_, token)) = self.active_calls.remove(&id) {
                token.cancel();
            }
        }
        for id in keys(&self.active_listens) {
            let forwarder = self.active_listens.remove(&id);
            drop(forwarder);
        }

        self.protocol.close();
        self.on_did_close.fire(());
        self.on_did_close.dispose();
    }
}

fn keys<V>(map: &DashMap<u64, V>) -> Vec<u64> {
    map.iter().map(|entry| *entry.key()).collect()
}

/// The client half of one remote channel on a `Connection`.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
    name: String,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("conn", &self.inner.id)
            .field("channel", &self.name)
            .finish()
    }
}

impl ChannelClient {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Withdraws a pending call if its future goes away before the reply.
struct CallGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.inner.pending.remove(&self.id).is_some() {
            tracing::debug!(conn = %self.inner.id, id = self.id, "call cancelled locally");
            self.inner.send_frame(&Frame::Cancel { id: self.id });
        }
    }
}

#[async_trait::async_trait]
impl ClientChannel for ChannelClient {
    async fn call(&self, command: &str, arg: Value, token: Option<CancellationToken>) -> Result<Value> {
        let token = token.unwrap_or_default();
        token.check()?;
        if self.inner.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.inner.request_ids.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Call {
            id,
            channel: self.name.clone(),
            command: command.to_string(),
            arg,
        };
        let bytes = frame.encode().map_err(Error::Encode)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _guard = CallGuard { inner: self.inner.clone(), id };

        // A close that ran before the insert would never see this entry.
        if self.inner.closed.is_cancelled() {
            self.inner.pending.remove(&id);
            return Err(Error::ConnectionClosed);
        }

        self.inner.enqueue(bytes);
        tokio::select! {
            reply = rx => reply.unwrap_or(Err(Error::ConnectionClosed)),
            _ = token.cancelled() => Err(Error::Canceled),
        }
    }

    fn listen(&self, event: &str, arg: Value) -> Event<Value> {
        let weak = Arc::downgrade(&self.inner);
        let release = weak.clone();
        let channel = self.name.clone();
        let event = event.to_string();
        let active: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let active_release = active.clone();

        let emitter = Emitter::with_hooks(
            move |emitter: &Emitter<Value>| {
                let Some(inner) = weak.upgrade().filter(|inner| !inner.closed.is_cancelled()) else {
                    emitter.dispose();
                    return;
                };
                let id = inner.subscription_ids.fetch_add(1, Ordering::Relaxed);
                inner.subscriptions.insert(id, emitter.clone());
                *active.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
                tracing::debug!(conn = %inner.id, id, %channel, %event, "subscribing");
                inner.send_frame(&Frame::Listen {
                    id,
                    channel: channel.clone(),
                    event: event.clone(),
                    arg: arg.clone(),
                });
            },
            move |_| {
                let id = active_release.lock().unwrap_or_else(PoisonError::into_inner).take();
                let (Some(id), Some(inner)) = (id, release.upgrade()) else { return };
                if inner.subscriptions.remove(&id).is_some() {
                    tracing::debug!(conn = %inner.id, id, "unsubscribing");
                    inner.send_frame(&Frame::Dispose { id });
                }
            },
        );
        emitter.event()
    }
}
