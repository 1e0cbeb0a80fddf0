//! # Router
//!
//! A server endpoint with many client connections.
//!
//! Channels registered on the router are reachable by every client (fan-out).
//! A broadcast channel goes the other way (fan-in): one client channel whose
//! calls go to a matching client and whose events merge those of every
//! matching client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;

use chanpack::MarshalRegistry;
use chanpack::Value;

use crate::cancel::CancellationToken;
use crate::channel::ClientChannel;
use crate::channel::ConnectionId;
use crate::channel::ServerChannel;
use crate::connection::Connection;
use crate::connection::DEFAULT_UNKNOWN_CHANNEL_TIMEOUT;
use crate::error::Error;
use crate::error::Result;
use crate::event::Emitter;
use crate::event::Event;
use crate::event::Subscription;
use crate::protocol::Protocol;
use crate::registry::ChannelRegistry;

/// A connected client, known once its `Hello` has arrived.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ConnectionId,
    /// The name the client announced.
    pub ctx: String,
    pub connection: Connection,
}

type Predicate = Arc<dyn Fn(&Client) -> bool + Send + Sync>;

struct Inner {
    name: String,
    registry: ChannelRegistry,
    marshal: MarshalRegistry,
    unknown_channel_timeout: Duration,
    /// Every accepted connection, including those still waiting for `Hello`.
    connections: DashMap<ConnectionId, Connection>,
    clients: DashMap<ConnectionId, Client>,
    on_did_client_connect: Emitter<Client>,
    on_did_client_disconnect: Emitter<Client>,
    disposed: CancellationToken,
}

/// A multi-client server endpoint.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

/// Fluent configuration for a `Router`.
pub struct RouterBuilder {
    name: String,
    registry: ChannelRegistry,
    marshal: MarshalRegistry,
    unknown_channel_timeout: Duration,
}

impl RouterBuilder {
    /// The context name announced to every client.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn registry(mut self, registry: ChannelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn marshal_registry(mut self, marshal: MarshalRegistry) -> Self {
        self.marshal = marshal;
        self
    }

    pub fn unknown_channel_timeout(mut self, timeout: Duration) -> Self {
        self.unknown_channel_timeout = timeout;
        self
    }

    pub fn build(self) -> Router {
        Router {
            inner: Arc::new(Inner {
                name: self.name,
                registry: self.registry,
                marshal: self.marshal,
                unknown_channel_timeout: self.unknown_channel_timeout,
                connections: DashMap::new(),
                clients: DashMap::new(),
                on_did_client_connect: Emitter::new(),
                on_did_client_disconnect: Emitter::new(),
                disposed: CancellationToken::new(),
            }),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            name: "server".into(),
            registry: ChannelRegistry::new(),
            marshal: MarshalRegistry::default(),
            unknown_channel_timeout: DEFAULT_UNKNOWN_CHANNEL_TIMEOUT,
        }
    }

    /// Starts serving a new client over `protocol`.
    ///
    /// The client joins `clients()` once its `Hello` arrives. Must be called
    /// within a tokio runtime.
    pub fn accept(&self, protocol: impl Protocol) -> Connection {
        let connection = Connection::builder(protocol)
            .name(self.inner.name.clone())
            .registry(self.inner.registry.clone())
            .marshal_registry(self.inner.marshal.clone())
            .unknown_channel_timeout(self.inner.unknown_channel_timeout)
            .build();
        let id = connection.id();

        if self.inner.disposed.is_cancelled() {
            connection.dispose();
            return connection;
        }
        self.inner.connections.insert(id, connection.clone());

        let inner = self.inner.clone();
        let conn = connection.clone();
        tokio::spawn(async move {
            if let Some(ctx) = conn.wait_for_peer().await {
                let client = Client { id, ctx, connection: conn.clone() };
                inner.clients.insert(id, client.clone());
                tracing::debug!(conn = %id, ctx = %client.ctx, "client connected");
                inner.on_did_client_connect.fire(client);
                conn.closed().await;
            }

            inner.connections.remove(&id);
            if let Some((_, client)) = inner.clients.remove(&id) {
                tracing::debug!(conn = %id, ctx = %client.ctx, "client disconnected");
                inner.on_did_client_disconnect.fire(client);
            }
        });

        connection
    }

    /// Serves `channel` to every client, current and future.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        self.inner.registry.register(name, channel);
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    /// Snapshot of the connected clients, ordered by connection id.
    pub fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.inner.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn on_did_client_connect(&self) -> Event<Client> {
        self.inner.on_did_client_connect.event()
    }

    pub fn on_did_client_disconnect(&self) -> Event<Client> {
        self.inner.on_did_client_disconnect.event()
    }

    /// A client channel over every client matching `predicate`.
    pub fn broadcast_channel(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&Client) -> bool + Send + Sync + 'static,
    ) -> Arc<dyn ClientChannel> {
        Arc::new(BroadcastChannel {
            router: self.inner.clone(),
            name: name.into(),
            predicate: Arc::new(predicate),
        })
    }

    /// Disposes every client connection. Later `accept`s are closed immediately.
    pub fn dispose(&self) {
        self.inner.disposed.cancel();
        let ids: Vec<ConnectionId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.inner.connections.remove(&id) {
                connection.dispose();
            }
        }
    }
}

fn lock<X>(m: &Mutex<X>) -> MutexGuard<'_, X> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BroadcastChannel {
    router: Arc<Inner>,
    name: String,
    predicate: Predicate,
}

impl BroadcastChannel {
    fn pick(&self) -> Option<Client> {
        let matching: Vec<Client> = self
            .router
            .clients
            .iter()
            .filter(|e| (self.predicate)(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matching.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Per-client subscriptions behind one merged event.
#[derive(Default)]
struct Merge {
    per_client: HashMap<ConnectionId, Subscription>,
    on_connect: Option<Subscription>,
    on_disconnect: Option<Subscription>,
}

#[async_trait::async_trait]
impl ClientChannel for BroadcastChannel {
    async fn call(&self, command: &str, arg: Value, token: Option<CancellationToken>) -> Result<Value> {
        let token = token.unwrap_or_default();
        token.check()?;

        let client = match self.pick() {
            Some(client) => client,
            None => {
                let mut connects = self.router.on_did_client_connect.event().stream();
                loop {
                    if let Some(client) = self.pick() {
                        break client;
                    }
                    tokio::select! {
                        next = connects.recv() => if next.is_none() {
                            return Err(Error::ConnectionClosed);
                        },
                        _ = token.cancelled() => return Err(Error::Canceled),
                        _ = self.router.disposed.cancelled() => return Err(Error::ConnectionClosed),
                    }
                }
            }
        };

        tracing::trace!(conn = %client.id, channel = %self.name, %command, "broadcast call routed");
        client.connection.channel(self.name.clone()).call(command, arg, Some(token)).await
    }

    fn listen(&self, event: &str, arg: Value) -> Event<Value> {
        let router = self.router.clone();
        let channel = self.name.clone();
        let event = event.to_string();
        let predicate = self.predicate.clone();
        let state: Arc<Mutex<Merge>> = Arc::new(Mutex::new(Merge::default()));
        let release = state.clone();

        let emitter = Emitter::with_hooks(
            move |emitter: &Emitter<Value>| {
                let downstream = emitter.downgrade();
                let channel = channel.clone();
                let event = event.clone();
                let arg = arg.clone();
                let attach = Arc::new(move |client: &Client| -> Subscription {
                    let downstream = downstream.clone();
                    client
                        .connection
                        .channel(channel.clone())
                        .listen(&event, arg.clone())
                        .on(move |value: &Value| {
                            if let Some(emitter) = downstream.upgrade() {
                                emitter.fire(value.clone());
                            }
                        })
                });

                let join = {
                    let state = state.clone();
                    let attach = attach.clone();
                    let predicate = predicate.clone();
                    move |client: &Client| {
                        if !predicate(client) {
                            return;
                        }
                        // Reserve the slot first so a racing join for the same client backs off.
                        {
                            let mut merge = lock(&*state);
                            if merge.per_client.contains_key(&client.id) {
                                return;
                            }
                            merge.per_client.insert(client.id, Subscription::inert());
                        }
                        let subscription = attach(client);
                        // Left (or released) while attaching: the new subscription is dropped.
                        let unused = match lock(&*state).per_client.get_mut(&client.id) {
                            Some(slot) => std::mem::replace(slot, subscription),
                            None => subscription,
                        };
                        drop(unused);
                    }
                };
                let leave = {
                    let state = state.clone();
                    move |client: &Client| {
                        let removed = lock(&*state).per_client.remove(&client.id);
                        drop(removed);
                    }
                };

                // Watch membership first so a client joining during the snapshot is not missed.
                let on_connect = router.on_did_client_connect.event().on(join.clone());
                let on_disconnect = router.on_did_client_disconnect.event().on(leave);
                {
                    let mut merge = lock(&*state);
                    merge.on_connect = Some(on_connect);
                    merge.on_disconnect = Some(on_disconnect);
                }
                let current: Vec<Client> = router.clients.iter().map(|e| e.value().clone()).collect();
                for client in &current {
                    join(client);
                }
            },
            move |_| {
                let released = std::mem::take(&mut *lock(&*release));
                drop(released);
            },
        );
        emitter.event()
    }
}
