//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chanpack::ByteBuf;
use chanpack::Uri;
use chanpack::Value;
use chanrpc::Connection;
use chanrpc::Emitter;
use chanrpc::Error;
use chanrpc::MemoryProtocol;
use chanrpc::ServiceTable;
use tokio::sync::Notify;

/// Installs a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Fails the test instead of hanging when `fut` stalls.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Polls `cond` until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Two connections joined by an in-memory pipe.
pub fn connect(server: &str, client: &str) -> (Connection, Connection) {
    let (a, b) = MemoryProtocol::pair();
    (Connection::new(a, server), Connection::new(b, client))
}

/// The service most suites talk to.
#[derive(Default)]
pub struct TestService {
    pub pong: Emitter<Value>,
    pub started: Notify,
    pub saw_cancel: AtomicBool,
}

impl TestService {
    pub fn table() -> ServiceTable<TestService> {
        ServiceTable::new()
            .method("marco", |_, _| async { Ok("polo") })
            .method("error", |_, args| async move {
                let message: String = args.get(0)?;
                Err::<Value, _>(anyhow::anyhow!(message))
            })
            .method_with_token("wait", |svc: Arc<TestService>, _, token| async move {
                svc.started.notify_one();
                token.cancelled().await;
                svc.saw_cancel.store(true, Ordering::SeqCst);
                Err::<Value, _>(Error::Canceled.into())
            })
            .method("fire", |svc: Arc<TestService>, args| async move {
                for value in args.into_vec() {
                    svc.pong.fire(value);
                }
                Ok(())
            })
            .method("buffersLength", |_, args| async move {
                let buffers: Vec<ByteBuf> = args.get(0)?;
                Ok(buffers.iter().map(|b| b.0.len()).sum::<usize>())
            })
            .method("echo", |_, args| async move { Ok(args.into_vec()) })
            .method("dirname", |_, args| async move {
                let mut uri: Uri = args.get(0)?;
                if let Some(idx) = uri.path.rfind('/') {
                    uri.path.truncate(idx);
                }
                Ok(uri)
            })
            .event("onPong", |svc, _| svc.pong.event())
            .event("onPongMatching", |svc, arg| svc.pong.event().filter(move |v| *v == arg))
    }
}
