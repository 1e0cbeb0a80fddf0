//! One-to-one calls, events, cancellation and lifecycle over a single connection.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chanpack::ByteBuf;
use chanpack::IntoValue;
use chanpack::MarshalRegistry;
use chanpack::Opaque;
use chanpack::Uri;
use chanpack::Value;
use chanrpc::CancellationToken;
use chanrpc::ClientChannel;
use chanrpc::Connection;
use chanrpc::Context;
use chanrpc::Error;
use chanrpc::Event;
use chanrpc::MemoryProtocol;
use chanrpc::Protocol;
use chanrpc::ProxyChannel;
use chanrpc::ServerChannel;
use chanwire::ErrorKind;
use chanwire::Frame;

use common::TestService;
use common::connect;
use common::eventually;
use common::init_tracing;
use common::within;

fn serve(conn: &Connection) -> Arc<TestService> {
    let service = Arc::new(TestService::default());
    conn.register_channel("test", ProxyChannel::from_service(service.clone(), TestService::table()));
    service
}

fn args(values: Vec<Value>) -> Value {
    Value::List(values)
}

#[tokio::test]
async fn test_call_returns_callee_value() {
    init_tracing();
    let (server, client) = connect("server", "client");
    serve(&server);

    let result = within(client.channel("test").call("marco", Value::Undefined, None)).await;
    assert_eq!(result, Ok(Value::from("polo")));
}

#[tokio::test]
async fn test_callee_error_message_reaches_caller() {
    init_tracing();
    let (server, client) = connect("server", "client");
    serve(&server);

    let err = within(client.channel("test").call("error", args(vec!["nice error".into()]), None))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Remote("nice error".into()));
    assert_eq!(err.to_string(), "nice error");
    assert!(!err.is_canceled());
}

#[tokio::test]
async fn test_precancelled_token_short_circuits() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);

    let token = CancellationToken::new();
    token.cancel();
    let err = within(client.channel("test").call("fire", args(vec!["boom".into()]), Some(token)))
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(client.pending_calls(), 0);

    // Nothing reached the server: a later round trip sees no side effect.
    let mut pongs = service.pong.event().stream();
    within(client.channel("test").call("marco", Value::Undefined, None)).await.unwrap();
    assert_eq!(pongs.try_recv(), None);
}

#[tokio::test]
async fn test_cancel_in_flight_rejects_and_reaches_callee() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);

    let token = CancellationToken::new();
    let call = {
        let channel = client.channel("test");
        let token = token.clone();
        tokio::spawn(async move { channel.call("wait", Value::Undefined, Some(token)).await })
    };
    within(service.started.notified()).await;

    token.cancel();
    let err = within(call).await.unwrap().unwrap_err();
    assert_eq!(err, Error::Canceled);
    assert_eq!(client.pending_calls(), 0);

    eventually(|| service.saw_cancel.load(Ordering::SeqCst)).await;

    // The callee's late reply is ignored and the connection keeps working.
    let result = within(client.channel("test").call("marco", Value::Undefined, None)).await;
    assert_eq!(result, Ok(Value::from("polo")));
}

#[tokio::test]
async fn test_slow_call_does_not_block_later_call() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);

    let slow = {
        let channel = client.channel("test");
        tokio::spawn(async move { channel.call("wait", Value::Undefined, None).await })
    };
    within(service.started.notified()).await;

    let fast = within(client.channel("test").call("marco", Value::Undefined, None)).await;
    assert_eq!(fast, Ok(Value::from("polo")));
    assert!(!slow.is_finished());
    assert_eq!(client.pending_calls(), 1);
    slow.abort();
}

#[tokio::test]
async fn test_dropping_call_future_cancels_remote() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);

    let call = {
        let channel = client.channel("test");
        tokio::spawn(async move { channel.call("wait", Value::Undefined, None).await })
    };
    within(service.started.notified()).await;

    call.abort();
    eventually(|| service.saw_cancel.load(Ordering::SeqCst)).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_events_arrive_in_order_after_subscribing() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);
    let channel = client.channel("test");

    // Fired before anyone listens: never delivered.
    service.pong.fire("early".into());

    let mut events = channel.listen("onPong", Value::Undefined).stream();
    within(channel.call("fire", args(vec!["hello".into()]), None)).await.unwrap();
    within(channel.call("fire", args(vec!["world".into()]), None)).await.unwrap();

    assert_eq!(within(events.recv()).await, Some(Value::from("hello")));
    assert_eq!(within(events.recv()).await, Some(Value::from("world")));
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_listen_reaches_channel_registered_later() {
    init_tracing();
    let (server, client) = connect("server", "client");

    let mut events = client.channel("test").listen("onPong", Value::Undefined).stream();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let service = serve(&server);

    eventually(|| service.pong.has_listeners()).await;
    service.pong.fire(Value::from("hello"));
    assert_eq!(within(events.recv()).await, Some(Value::from("hello")));
}

#[tokio::test]
async fn test_dispose_while_waiting_for_channel_withdraws_listen() {
    init_tracing();
    let (server, client) = connect("server", "client");

    let events = client.channel("test").listen("onPong", Value::Undefined).stream();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(events);
    assert_eq!(client.active_subscriptions(), 0);

    // Frames are handled in order: once this reply arrives the `Dispose` has been seen.
    server.register_channel("who", Arc::new(WhoAmI));
    within(client.channel("who").call("ask", Value::Undefined, None)).await.unwrap();

    let service = serve(&server);
    within(client.channel("test").call("marco", Value::Undefined, None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!service.pong.has_listeners());
}

#[tokio::test]
async fn test_subscription_is_lazy_and_released() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);
    let channel = client.channel("test");

    let event = channel.listen("onPong", Value::Undefined);
    within(channel.call("marco", Value::Undefined, None)).await.unwrap();
    assert_eq!(client.active_subscriptions(), 0);
    assert!(!service.pong.has_listeners());

    let stream = event.stream();
    within(channel.call("marco", Value::Undefined, None)).await.unwrap();
    assert_eq!(client.active_subscriptions(), 1);
    assert!(service.pong.has_listeners());

    drop(stream);
    assert_eq!(client.active_subscriptions(), 0);
    within(channel.call("marco", Value::Undefined, None)).await.unwrap();
    assert!(!service.pong.has_listeners());
}

#[tokio::test]
async fn test_listen_argument_narrows_event() {
    init_tracing();
    let (server, client) = connect("server", "client");
    serve(&server);
    let channel = client.channel("test");

    let mut matching = channel.listen("onPongMatching", Value::from("b")).stream();
    let fired = args(vec!["a".into(), "b".into(), "c".into(), "b".into()]);
    within(channel.call("fire", fired, None)).await.unwrap();

    assert_eq!(within(matching.recv()).await, Some(Value::from("b")));
    assert_eq!(within(matching.recv()).await, Some(Value::from("b")));
    assert_eq!(matching.try_recv(), None);
}

#[tokio::test]
async fn test_byte_blobs_keep_their_lengths() {
    init_tracing();
    let (server, client) = connect("server", "client");
    serve(&server);

    let buffers = vec![ByteBuf(vec![1, 2]), ByteBuf(vec![1, 2, 3])].into_value();
    let result = within(client.channel("test").call("buffersLength", args(vec![buffers]), None)).await;
    assert_eq!(result, Ok(Value::UInt(5)));
}

#[tokio::test]
async fn test_marshalled_uri_is_revived() {
    init_tracing();
    let (server, client) = connect("server", "client");
    serve(&server);

    let uri = Uri::file("/home/user/notes.txt");
    let result = within(client.channel("test").call("dirname", args(vec![uri.into_value()]), None))
        .await
        .unwrap();
    assert_eq!(result.downcast_ref::<Uri>(), Some(&Uri::file("/home/user")));
}

#[tokio::test]
async fn test_unknown_channel_and_command_are_not_implemented() {
    init_tracing();
    let (a, b) = MemoryProtocol::pair();
    let server = Connection::builder(a)
        .name("server")
        .unknown_channel_timeout(Duration::from_millis(50))
        .build();
    let client = Connection::new(b, "client");
    serve(&server);

    let err = within(client.channel("nope").call("marco", Value::Undefined, None)).await.unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));

    let err = within(client.channel("test").call("polo", Value::Undefined, None)).await.unwrap_err();
    assert_eq!(err, Error::NotImplemented("command 'polo'".into()));
}

#[tokio::test]
async fn test_channel_registered_after_call_is_reached() {
    init_tracing();
    let (server, client) = connect("server", "client");

    let call = {
        let channel = client.channel("test");
        tokio::spawn(async move { channel.call("marco", Value::Undefined, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    serve(&server);

    assert_eq!(within(call).await.unwrap(), Ok(Value::from("polo")));
}

struct WhoAmI;

#[async_trait::async_trait]
impl ServerChannel for WhoAmI {
    async fn call(&self, ctx: &Context, _: &str, _: Value, _: CancellationToken) -> anyhow::Result<Value> {
        Ok(Value::from(ctx.peer.clone()))
    }

    fn listen(&self, _: &Context, _: &str, _: Value) -> anyhow::Result<Event<Value>> {
        Ok(Event::never())
    }
}

#[tokio::test]
async fn test_server_sees_peer_context() {
    init_tracing();
    let (server, client) = connect("main", "window:7");
    server.register_channel("who", Arc::new(WhoAmI));

    let result = within(client.channel("who").call("ask", Value::Undefined, None)).await;
    assert_eq!(result, Ok(Value::from("window:7")));
    assert_eq!(within(client.wait_for_peer()).await.as_deref(), Some("main"));
}

#[tokio::test]
async fn test_both_sides_serve_channels() {
    init_tracing();
    let (left, right) = connect("left", "right");
    serve(&left);
    serve(&right);

    let (a, b) = within(async {
        let left_test = left.channel("test");
        let right_test = right.channel("test");
        tokio::join!(
            left_test.call("marco", Value::Undefined, None),
            right_test.call("marco", Value::Undefined, None),
        )
    })
    .await;
    assert_eq!(a, Ok(Value::from("polo")));
    assert_eq!(b, Ok(Value::from("polo")));
}

#[tokio::test]
async fn test_dispose_rejects_outstanding_and_ends_subscriptions() {
    init_tracing();
    let (server, client) = connect("server", "client");
    let service = serve(&server);
    let channel = client.channel("test");

    let mut events = channel.listen("onPong", Value::Undefined).stream();
    let call = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.call("wait", Value::Undefined, None).await })
    };
    within(service.started.notified()).await;

    let mut closed = client.on_did_close().stream();
    client.dispose();

    assert_eq!(within(call).await.unwrap(), Err(Error::ConnectionClosed));
    assert_eq!(within(events.recv()).await, None);
    assert_eq!(within(closed.recv()).await, Some(()));
    assert!(client.is_closed());

    // The peer notices, cancelling the callee.
    within(server.closed()).await;
    eventually(|| service.saw_cancel.load(Ordering::SeqCst)).await;

    let err = within(channel.call("marco", Value::Undefined, None)).await.unwrap_err();
    assert_eq!(err, Error::ConnectionClosed);
}

#[tokio::test]
async fn test_corrupt_frames_do_not_kill_the_connection() {
    init_tracing();
    let (raw, pipe) = MemoryProtocol::pair();
    let server = Connection::new(pipe, "server");
    serve(&server);
    let registry = MarshalRegistry::default();

    let hello = within(raw.recv()).await.unwrap().unwrap();
    assert_eq!(Frame::decode(&hello, &registry), Ok(Frame::Hello { ctx: "server".into() }));

    raw.send(&[0xFF, 0x00, 0x13]).await.unwrap();
    raw.send(&Frame::Hello { ctx: "raw".into() }.encode().unwrap()).await.unwrap();

    // A call whose argument fails to decode is answered with a failure.
    let bad = Frame::Call {
        id: 1,
        channel: "test".into(),
        command: "echo".into(),
        arg: Value::marshalled(Opaque { tag: "uri".into(), payload: Value::Int(3) }),
    };
    raw.send(&bad.encode().unwrap()).await.unwrap();
    let reply = Frame::decode(&within(raw.recv()).await.unwrap().unwrap(), &registry).unwrap();
    assert!(matches!(reply, Frame::CallErr { id: 1, kind: ErrorKind::Failure, .. }));

    let good = Frame::Call {
        id: 2,
        channel: "test".into(),
        command: "marco".into(),
        arg: Value::Undefined,
    };
    raw.send(&good.encode().unwrap()).await.unwrap();
    let reply = Frame::decode(&within(raw.recv()).await.unwrap().unwrap(), &registry).unwrap();
    assert_eq!(reply, Frame::CallOk { id: 2, value: Value::from("polo") });
    assert!(!server.is_closed());
}
