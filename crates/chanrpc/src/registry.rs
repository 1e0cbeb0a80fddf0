//! # Channel Registry
//!
//! Name-to-implementation map for server channels. Shared by every connection
//! of one endpoint, and late-bindable: a caller may reach a name shortly
//! before it is registered.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::channel::ServerChannel;

struct Inner {
    channels: DashMap<String, Arc<dyn ServerChannel>>,
    /// Bumped on every registration so waiters can re-check.
    generation: watch::Sender<u64>,
}

/// A cloneable handle to a shared set of server channels.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").field("channels", &self.names()).finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner { channels: DashMap::new(), generation }),
        }
    }

    /// Registers `channel` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        tracing::debug!(channel = %name, "channel registered");
        self.inner.channels.insert(name, channel);
        self.inner.generation.send_modify(|g| *g += 1);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ServerChannel>> {
        self.inner.channels.remove(name).map(|(_, channel)| channel)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServerChannel>> {
        self.inner.channels.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.channels.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.channels.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Returns the channel named `name`, waiting up to `timeout` for it to be registered.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Option<Arc<dyn ServerChannel>> {
        // Subscribe before looking so a registration in between is not missed.
        let mut rx = self.inner.generation.subscribe();
        if let Some(channel) = self.get(name) {
            return Some(channel);
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                if let Some(channel) = self.get(name) {
                    return Some(channel);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}
