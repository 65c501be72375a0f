//! Garbage collection. Grounded on `garbage.py`'s `GarbageCollector`:
//! periodic sweep, per-chat throttle, completed chats get persisted and
//! dropped, expired-but-unpersisted owned chats fire a zombie event and are
//! persisted the same way a completed chat is (spec.md §4.7's
//! `Persister.persist(chat, zombie=true)`), so the archive store still gets
//! exactly one row for a chat that never saw an ENDED status.

use std::sync::Arc;
use std::time::Duration;

use crate::chat::ChatManager;
use crate::hashring::{Hashring, NodeId};
use crate::persister::Persister;

/// Observes zombie detections — chats that ran past their expiration grace
/// without ever reaching a clean END. Production wiring logs and/or alerts;
/// tests assert on a fake.
pub trait ZombieObserver: Send + Sync {
    fn on_zombie(&self, chat_token: &str);
}

pub struct LoggingZombieObserver;
impl ZombieObserver for LoggingZombieObserver {
    fn on_zombie(&self, chat_token: &str) {
        tracing::warn!(chat = chat_token, "zombie chat detected");
    }
}

/// Runs a periodic sweep over every locally-known chat: completed chats are
/// persisted (if not already) and removed from the manager; expired,
/// unpersisted chats this node owns are reported to `observer` and persisted
/// (the archive row lands, but the chat is left in the manager until a later
/// sweep sees `persisted()` and removes it) — matching `_gc_chat_session`'s
/// "only act if this node still owns it" restraint, via the owner check
/// against `self_id`.
pub struct GarbageCollector {
    chats: Arc<ChatManager>,
    hashring: Arc<Hashring>,
    self_id: NodeId,
    persister: Arc<Persister>,
    observer: Arc<dyn ZombieObserver>,
    interval: Duration,
    throttle: Duration,
}

impl GarbageCollector {
    pub fn new(
        chats: Arc<ChatManager>,
        hashring: Arc<Hashring>,
        self_id: NodeId,
        persister: Arc<Persister>,
        observer: Arc<dyn ZombieObserver>,
        interval: Duration,
        throttle: Duration,
    ) -> Self {
        Self { chats, hashring, self_id, persister, observer, interval, throttle }
    }

    /// Runs sweeps forever until `shutdown` resolves. Intended to be
    /// `tokio::spawn`ed from `main`.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                _ = shutdown.changed() => {
                    tracing::info!("garbage collector shutting down");
                    break;
                }
            }
        }
    }

    /// Runs a single sweep immediately. `run` calls this on every tick;
    /// exposed directly so tests can drive a sweep without waiting on a
    /// real interval.
    pub async fn sweep_once(&self) {
        let ring = self.hashring.current();
        for chat in self.chats.all() {
            let is_owner = ring.owner(&chat.token).as_ref() == Some(&self.self_id);

            if chat.completed() {
                if !chat.persisted() {
                    if let Err(err) = self.persister.persist(&chat).await {
                        tracing::warn!(chat = %chat.token, %err, "gc persist failed");
                        continue;
                    }
                }
                self.chats.remove(&chat.token);
            } else if chat.expired() && is_owner {
                if chat.persisted() {
                    self.chats.remove(&chat.token);
                } else {
                    self.observer.on_zombie(&chat.token);
                    if let Err(err) = self.persister.persist(&chat).await {
                        tracing::warn!(chat = %chat.token, %err, "gc zombie persist failed");
                    }
                }
            }

            tokio::time::sleep(self.throttle).await;
        }
    }
}
