//! # Service Proxies
//!
//! Bridges plain Rust services and channels in both directions.
//!
//! `ProxyChannel::from_service` serves a service through an explicit dispatch
//! table of named methods and events. `ProxyChannel::to_service` wraps a
//! client channel so remote methods read like local calls.
//!
//! Arguments travel as one `Value::List`, one element per positional argument.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use chanpack::FromValue;
use chanpack::IntoValue;
use chanpack::Value;

use crate::cancel::CancellationToken;
use crate::channel::ClientChannel;
use crate::channel::Context;
use crate::channel::ServerChannel;
use crate::error::Error;
use crate::error::Result;
use crate::event::Event;

/// Positional arguments of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Splits a call argument: a list spreads, `Undefined` is empty,
    /// anything else is a single argument.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::List(values) => Self(values),
            Value::Undefined => Self(Vec::new()),
            other => Self(vec![other]),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Argument `index` as `T`. A missing argument reads as `Undefined`,
    /// so `Option<T>` parameters may be omitted.
    pub fn get<T: FromValue>(&self, index: usize) -> chanpack::Result<T> {
        T::from_value(self.0.get(index).cloned().unwrap_or_default())
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Arguments from `index` on.
    pub fn rest(&self, index: usize) -> &[Value] {
        self.0.get(index..).unwrap_or(&[])
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

type MethodFn<S> =
    Arc<dyn Fn(Arc<S>, Args, CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type EventFn<S> = Arc<dyn Fn(&S, Value) -> Event<Value> + Send + Sync>;

/// The named methods and events a service exposes.
pub struct ServiceTable<S> {
    methods: HashMap<String, MethodFn<S>>,
    events: HashMap<String, EventFn<S>>,
}

impl<S: Send + Sync + 'static> Default for ServiceTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync + 'static> ServiceTable<S> {
    pub fn new() -> Self {
        Self { methods: HashMap::new(), events: HashMap::new() }
    }

    /// Adds a method that ignores cancellation.
    pub fn method<F, Fut, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoValue,
    {
        self.method_with_token(name, move |service, args, _token| f(service, args))
    }

    /// Adds a method that receives the call's cancellation token.
    pub fn method_with_token<F, Fut, R>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<S>, Args, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: IntoValue,
    {
        let method: MethodFn<S> = Arc::new(move |service: Arc<S>, args: Args, token: CancellationToken| {
            f(service, args, token)
                .map(|result| result.map(IntoValue::into_value))
                .boxed()
        });
        self.methods.insert(name.into(), method);
        self
    }

    /// Adds an event. The getter receives the listen argument and may narrow the event by it.
    pub fn event(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&S, Value) -> Event<Value> + Send + Sync + 'static,
    ) -> Self {
        self.events.insert(name.into(), Arc::new(f));
        self
    }
}

struct ServiceChannel<S> {
    service: Arc<S>,
    table: ServiceTable<S>,
}

#[async_trait::async_trait]
impl<S: Send + Sync + 'static> ServerChannel for ServiceChannel<S> {
    async fn call(
        &self,
        _ctx: &Context,
        command: &str,
        arg: Value,
        token: CancellationToken,
    ) -> anyhow::Result<Value> {
        let Some(method) = self.table.methods.get(command).cloned() else {
            return Err(Error::NotImplemented(format!("command '{}'", command)).into());
        };
        method(self.service.clone(), Args::from_value(arg), token).await
    }

    fn listen(&self, _ctx: &Context, event: &str, arg: Value) -> anyhow::Result<Event<Value>> {
        match self.table.events.get(event) {
            Some(getter) => Ok(getter(self.service.as_ref(), arg)),
            None => Err(Error::NotImplemented(format!("event '{}'", event)).into()),
        }
    }
}

/// Options for `ProxyChannel::to_service`.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Prepended to the arguments of every call.
    pub context: Option<Value>,
    /// Answered locally by `ServiceProxy::property`, without a round trip.
    pub properties: HashMap<String, Value>,
}

/// Conversions between services and channels.
pub struct ProxyChannel;

impl ProxyChannel {
    /// Serves `service` through `table`.
    pub fn from_service<S: Send + Sync + 'static>(
        service: Arc<S>,
        table: ServiceTable<S>,
    ) -> Arc<dyn ServerChannel> {
        Arc::new(ServiceChannel { service, table })
    }

    /// Wraps `channel` as a service proxy.
    pub fn to_service(channel: Arc<dyn ClientChannel>, options: ProxyOptions) -> ServiceProxy {
        ServiceProxy { channel, options }
    }
}

/// Event members follow the `onDidChange` convention: `on` then an uppercase letter.
pub fn is_event_name(name: &str) -> bool {
    name.strip_prefix("on")
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_uppercase())
}

/// A local stand-in for a remote service.
#[derive(Clone)]
pub struct ServiceProxy {
    channel: Arc<dyn ClientChannel>,
    options: ProxyOptions,
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy").field("options", &self.options).finish_non_exhaustive()
    }
}

impl ServiceProxy {
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_token(method, args, None).await
    }

    pub async fn call_with_token(
        &self,
        method: &str,
        args: Vec<Value>,
        token: Option<CancellationToken>,
    ) -> Result<Value> {
        let mut list = Vec::with_capacity(args.len() + 1);
        if let Some(context) = &self.options.context {
            list.push(context.clone());
        }
        list.extend(args);
        self.channel.call(method, Value::List(list), token).await
    }

    /// Calls `method` and converts the reply to `R`.
    ///
    /// `args` becomes the positional arguments: a list spreads, `()` is none,
    /// anything else is a single argument. Wrap a lone list argument in a `vec!`.
    pub async fn call_as<R: FromValue>(&self, method: &str, args: impl IntoValue) -> Result<R> {
        let args = Args::from_value(args.into_value()).into_vec();
        let reply = self.call_with_token(method, args, None).await?;
        R::from_value(reply).map_err(Error::Decode)
    }

    /// Subscribes to the remote event `name`.
    ///
    /// # Errors
    /// `NotImplemented` if `name` is not event-shaped.
    pub fn listen(&self, name: &str) -> Result<Event<Value>> {
        self.listen_with(name, Value::Undefined)
    }

    /// Subscribes to the remote event `name`, passing `arg` to the event getter.
    pub fn listen_with(&self, name: &str, arg: Value) -> Result<Event<Value>> {
        if !is_event_name(name) {
            return Err(Error::NotImplemented(format!("'{}' is not an event", name)));
        }
        Ok(self.channel.listen(name, arg))
    }

    /// A locally configured property value.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.options.properties.get(name)
    }
}
