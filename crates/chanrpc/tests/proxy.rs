//! Services served through dispatch tables and consumed through proxies.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chanpack::ByteBuf;
use chanpack::IntoValue;
use chanpack::Value;
use chanrpc::Error;
use chanrpc::ProxyChannel;
use chanrpc::ProxyOptions;
use chanrpc::ServiceProxy;

use common::TestService;
use common::connect;
use common::init_tracing;
use common::within;

fn proxy_pair(options: ProxyOptions) -> (chanrpc::Connection, chanrpc::Connection, Arc<TestService>, ServiceProxy) {
    let (server, client) = connect("server", "client");
    let service = Arc::new(TestService::default());
    server.register_channel("test", ProxyChannel::from_service(service.clone(), TestService::table()));
    let proxy = ProxyChannel::to_service(Arc::new(client.channel("test")), options);
    (server, client, service, proxy)
}

#[tokio::test]
async fn test_proxy_calls_read_like_local_calls() {
    init_tracing();
    let (_server, _client, _, proxy) = proxy_pair(ProxyOptions::default());

    assert_eq!(within(proxy.call("marco", vec![])).await, Ok(Value::from("polo")));

    let echoed = within(proxy.call("echo", vec![Value::Int(1), Value::from("two")])).await;
    assert_eq!(echoed, Ok(Value::List(vec![Value::Int(1), Value::from("two")])));

    let err = within(proxy.call("error", vec![Value::from("bad input")])).await.unwrap_err();
    assert_eq!(err, Error::Remote("bad input".into()));
}

#[tokio::test]
async fn test_proxy_context_is_prepended() {
    init_tracing();
    let options = ProxyOptions { context: Some(Value::from("window:1")), ..Default::default() };
    let (_server, _client, _, proxy) = proxy_pair(options);

    let echoed = within(proxy.call("echo", vec![Value::Int(7)])).await;
    assert_eq!(echoed, Ok(Value::List(vec![Value::from("window:1"), Value::Int(7)])));
}

#[tokio::test]
async fn test_proxy_properties_answer_locally() {
    init_tracing();
    let mut properties = HashMap::new();
    properties.insert("version".to_string(), Value::from("1.2.0"));
    let (_server, client, _, proxy) = proxy_pair(ProxyOptions { properties, ..Default::default() });

    assert_eq!(proxy.property("version"), Some(&Value::from("1.2.0")));
    assert_eq!(proxy.property("missing"), None);
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_proxy_events_follow_naming_convention() {
    init_tracing();
    let (_server, _client, _, proxy) = proxy_pair(ProxyOptions::default());

    let err = proxy.listen("marco").unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
    assert!(proxy.listen("once").is_err());

    let mut events = proxy.listen("onPong").unwrap().stream();
    within(proxy.call("fire", vec![Value::from("ping")])).await.unwrap();
    assert_eq!(within(events.recv()).await, Some(Value::from("ping")));
}

#[tokio::test]
async fn test_proxy_listen_with_argument() {
    init_tracing();
    let (_server, _client, _, proxy) = proxy_pair(ProxyOptions::default());

    let mut matching = proxy.listen_with("onPongMatching", Value::Int(2)).unwrap().stream();
    let fired = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
    within(proxy.call("fire", fired)).await.unwrap();

    assert_eq!(within(matching.recv()).await, Some(Value::Int(2)));
    assert_eq!(matching.try_recv(), None);
}

#[tokio::test]
async fn test_unknown_event_is_logged_and_silent() {
    init_tracing();
    let (_server, client, _, proxy) = proxy_pair(ProxyOptions::default());

    let mut events = proxy.listen("onNothing").unwrap().stream();
    assert_eq!(client.active_subscriptions(), 1);
    within(proxy.call("marco", vec![])).await.unwrap();
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_typed_arguments_are_checked_by_callee() {
    init_tracing();
    let (_server, _client, _, proxy) = proxy_pair(ProxyOptions::default());

    // `error` expects a string message.
    let err = within(proxy.call("error", vec![Value::Int(3)])).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));

    let err = within(proxy.call("missing", vec![])).await.unwrap_err();
    assert_eq!(err, Error::NotImplemented("command 'missing'".into()));
}

#[tokio::test]
async fn test_typed_calls_convert_arguments_and_reply() {
    init_tracing();
    let (_server, _client, _, proxy) = proxy_pair(ProxyOptions::default());

    let polo: String = within(proxy.call_as("marco", ())).await.unwrap();
    assert_eq!(polo, "polo");

    let buffers = vec![ByteBuf(vec![0; 2]), ByteBuf(vec![0; 3])].into_value();
    let total: usize = within(proxy.call_as("buffersLength", vec![buffers])).await.unwrap();
    assert_eq!(total, 5);

    let echoed: Vec<i64> = within(proxy.call_as("echo", vec![Value::Int(1), Value::Int(2)])).await.unwrap();
    assert_eq!(echoed, vec![1, 2]);

    let err = within(proxy.call_as::<i64>("marco", ())).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}
