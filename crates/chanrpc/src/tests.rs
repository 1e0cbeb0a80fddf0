use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chanpack::Value;
use chanwire::ErrorKind;
use futures::StreamExt;

use crate::error::classify;
use crate::proxy::is_event_name;
use crate::*;

// ============================================================================
//  CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_token_cancel_is_shared_and_sticky() {
    let token = CancellationToken::new();
    let clone = token.clone();
    assert!(!clone.is_cancelled());
    assert_eq!(clone.check(), Ok(()));

    token.cancel();
    token.cancel();
    assert!(clone.is_cancelled());
    assert_eq!(clone.check(), Err(Error::Canceled));

    // Resolves immediately once cancelled.
    tokio::time::timeout(Duration::from_millis(100), clone.cancelled())
        .await
        .expect("already cancelled");
}

#[tokio::test]
async fn test_token_wakes_waiters() {
    let token = CancellationToken::new();
    let waiter = {
        let token = token.clone();
        tokio::spawn(async move { token.cancelled().await })
    };
    tokio::task::yield_now().await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woke")
        .expect("waiter task");
}

// ============================================================================
//  EVENTS
// ============================================================================

#[test]
fn test_emitter_delivers_in_order_to_every_listener() {
    let emitter = Emitter::<i64>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let seen = seen.clone();
        emitter.event().on(move |v| seen.lock().unwrap().push(("a", *v)))
    };
    emitter.fire(1);
    let b = {
        let seen = seen.clone();
        emitter.event().on(move |v| seen.lock().unwrap().push(("b", *v)))
    };
    emitter.fire(2);
    drop(a);
    emitter.fire(3);
    b.dispose();
    emitter.fire(4);

    assert_eq!(*seen.lock().unwrap(), vec![("a", 1), ("a", 2), ("b", 2), ("b", 3)]);
    assert!(!emitter.has_listeners());
}

#[test]
fn test_hooks_run_on_first_and_last_listener() {
    let first = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicUsize::new(0));
    let emitter = {
        let first = first.clone();
        let last = last.clone();
        Emitter::<()>::with_hooks(
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                last.fetch_add(1, Ordering::SeqCst);
            },
        )
    };

    let s1 = emitter.event().on(|_| {});
    let s2 = emitter.event().on(|_| {});
    assert_eq!(first.load(Ordering::SeqCst), 1);
    drop(s1);
    assert_eq!(last.load(Ordering::SeqCst), 0);
    drop(s2);
    assert_eq!(last.load(Ordering::SeqCst), 1);

    let _s3 = emitter.event().on(|_| {});
    assert_eq!(first.load(Ordering::SeqCst), 2);
}

#[test]
fn test_listener_may_detach_itself_while_firing() {
    let emitter = Emitter::<i64>::new();
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let count = Arc::new(AtomicUsize::new(0));

    let sub = {
        let slot = slot.clone();
        let count = count.clone();
        emitter.event().on(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            let taken = slot.lock().unwrap().take();
            drop(taken);
        })
    };
    *slot.lock().unwrap() = Some(sub);

    emitter.fire(1);
    emitter.fire(2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_ends_on_dispose() {
    let emitter = Emitter::<String>::new();
    let mut stream = emitter.event().stream();
    emitter.fire("hello".into());
    emitter.fire("world".into());
    emitter.dispose();

    let collected: Vec<String> = (&mut stream).collect().await;
    assert_eq!(collected, vec!["hello", "world"]);

    // A disposed emitter accepts no new listeners.
    let mut late = emitter.event().stream();
    assert_eq!(late.recv().await, None);
}

#[tokio::test]
async fn test_filter_is_lazy() {
    let upstream = Emitter::<i64>::new();
    let evens = upstream.event().filter(|v| v % 2 == 0);
    assert!(!upstream.has_listeners());

    let mut stream = evens.stream();
    assert!(upstream.has_listeners());
    for v in 1..=4 {
        upstream.fire(v);
    }
    assert_eq!(stream.recv().await, Some(2));
    assert_eq!(stream.recv().await, Some(4));

    drop(stream);
    assert!(!upstream.has_listeners());
}

#[test]
fn test_never_fires() {
    let event = Event::<i64>::never();
    let sub = event.on(|_| panic!("never fires"));
    sub.dispose();
}

// ============================================================================
//  REGISTRY
// ============================================================================

struct Echo;

#[async_trait::async_trait]
impl ServerChannel for Echo {
    async fn call(&self, _: &Context, _: &str, arg: Value, _: CancellationToken) -> anyhow::Result<Value> {
        Ok(arg)
    }

    fn listen(&self, _: &Context, event: &str, _: Value) -> anyhow::Result<Event<Value>> {
        Err(Error::NotImplemented(event.to_string()).into())
    }
}

#[tokio::test]
async fn test_registry_wait_for_late_registration() {
    let registry = ChannelRegistry::new();
    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait_for("echo", Duration::from_secs(5)).await.is_some() })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.register("echo", Arc::new(Echo));
    assert!(waiter.await.unwrap());
    assert_eq!(registry.names(), vec!["echo".to_string()]);
}

#[tokio::test]
async fn test_registry_wait_for_times_out() {
    let registry = ChannelRegistry::new();
    registry.register("other", Arc::new(Echo));
    assert!(registry.wait_for("missing", Duration::from_millis(20)).await.is_none());
    assert!(registry.unregister("other").is_some());
    assert!(!registry.contains("other"));
}

// ============================================================================
//  ERRORS
// ============================================================================

#[test]
fn test_callee_errors_classify_by_kind() {
    let canceled = anyhow::Error::from(Error::Canceled);
    assert_eq!(classify(&canceled).0, ErrorKind::Canceled);

    let missing = anyhow::Error::from(Error::NotImplemented("command 'x'".into()));
    assert_eq!(classify(&missing), (ErrorKind::NotImplemented, "command 'x'".to_string()));

    let plain = anyhow::anyhow!("nice error");
    assert_eq!(classify(&plain), (ErrorKind::Failure, "nice error".to_string()));
}

#[test]
fn test_wire_errors_rebuild_caller_errors() {
    assert_eq!(Error::from_wire(ErrorKind::Canceled, "Canceled".into()), Error::Canceled);
    assert!(Error::from_wire(ErrorKind::Canceled, String::new()).is_canceled());
    let remote = Error::from_wire(ErrorKind::Failure, "nice error".into());
    assert_eq!(remote.to_string(), "nice error");
    assert!(!remote.is_canceled());
}

// ============================================================================
//  PROXY HELPERS
// ============================================================================

#[test]
fn test_event_names() {
    assert!(is_event_name("onDidChange"));
    assert!(is_event_name("onPong"));
    assert!(!is_event_name("on"));
    assert!(!is_event_name("once"));
    assert!(!is_event_name("marco"));
}

#[test]
fn test_args_positional_access() {
    let args = Args::from_value(Value::List(vec![Value::from("a"), Value::Int(2), Value::Null]));
    assert_eq!(args.len(), 3);
    assert_eq!(args.get::<String>(0).unwrap(), "a");
    assert_eq!(args.get::<i64>(1).unwrap(), 2);
    assert_eq!(args.get::<Option<i64>>(5).unwrap(), None);
    assert!(args.get::<String>(1).is_err());
    assert_eq!(args.rest(1).len(), 2);
    assert!(args.rest(9).is_empty());

    assert!(Args::from_value(Value::Undefined).is_empty());
    assert_eq!(Args::from_value(Value::Int(1)).len(), 1);
}

// ============================================================================
//  PROTOCOL
// ============================================================================

#[tokio::test]
async fn test_memory_protocol_close_ends_peer() {
    let (a, b) = MemoryProtocol::pair();
    a.send(b"ping").await.unwrap();
    assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));

    a.close();
    assert!(a.send(b"late").await.is_err());
    assert_eq!(b.recv().await.unwrap(), None);
}
