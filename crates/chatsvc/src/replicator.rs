//! Quorum replication. Grounded on `replication.py`'s
//! `ReplicationAsyncResult`/`Replicator` and, for the bounded worker-pool
//! shape, `automations::server`'s semaphore-gated task loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};

use std::collections::HashMap;

use crate::chat::{Chat, ChatManager};
use crate::error::ReplicationError;
use crate::hashring::{Hashring, NodeId};
use crate::message::{Message, UserState};

/// A point-in-time copy of a chat's scalar state and messages, sent to a
/// peer on every replicated write and, in full, on ring-change catch-up.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ChatSnapshot {
    pub chat_token: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub users: HashMap<String, UserState>,
    pub session: HashMap<String, serde_json::Value>,
    pub persisted: bool,
    pub messages: Vec<Message>,
    /// True when `messages` is the chat's entire history rather than an
    /// incremental batch — always true for ring-change catch-up snapshots.
    pub full_snapshot: bool,
}

impl ChatSnapshot {
    /// Builds a snapshot carrying only `messages` (typically the batch just
    /// appended) alongside the chat's current scalar state.
    pub fn incremental(chat: &Chat, messages: Vec<Message>) -> Self {
        let full_snapshot = messages.len() == chat.all_messages().len();
        Self {
            chat_token: chat.token.clone(),
            start: chat.start(),
            end: chat.end(),
            users: chat.users(),
            session: chat.session(),
            persisted: chat.persisted(),
            messages,
            full_snapshot,
        }
    }

    /// Builds a snapshot carrying the chat's entire message history, used
    /// for ring-change catch-up.
    pub fn full(chat: &Chat) -> Self {
        Self::incremental(chat, chat.all_messages())
    }
}

/// Sends RPCs to peer nodes. A thin seam so the replicator can be tested
/// without a real network — the production implementation lives in `rpc`.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    async fn replicate(&self, node: &NodeId, snapshot: ChatSnapshot) -> Result<(), ReplicationError>;
}

/// Counts replica acknowledgements against N/W, matching
/// `ReplicationAsyncResult`: succeeds as soon as W values arrive, fails once
/// more than `max_errors` have failed (since W can no longer be reached),
/// and is "complete" once all N attempts have resolved one way or the other.
struct QuorumCounter {
    n: usize,
    w: usize,
    max_errors: usize,
    successes: usize,
    failures: usize,
}

enum QuorumState {
    Pending,
    Satisfied,
    Failed,
}

impl QuorumCounter {
    fn new(n: usize, w: usize, max_errors: usize) -> Self {
        Self { n, w, max_errors, successes: 0, failures: 0 }
    }

    fn record_success(&mut self) -> QuorumState {
        self.successes += 1;
        self.state()
    }

    fn record_failure(&mut self) -> QuorumState {
        self.failures += 1;
        self.state()
    }

    fn state(&self) -> QuorumState {
        if self.successes >= self.w {
            QuorumState::Satisfied
        } else if self.failures > self.max_errors {
            QuorumState::Failed
        } else {
            QuorumState::Pending
        }
    }

    fn outstanding(&self) -> usize {
        self.n.saturating_sub(self.successes + self.failures)
    }
}

/// One call to `replicate`, handed to a pool worker. Carries its own reply
/// channel since, unlike `Persister`'s fire-and-forget `enqueue`, the caller
/// (`Dispatcher::send_message`) needs the quorum outcome to decide whether
/// the send itself succeeded.
struct ReplicationJob {
    snapshot: ChatSnapshot,
    preference_list: Vec<NodeId>,
    n: usize,
    w: usize,
    max_errors: usize,
    timeout: Duration,
    reply: oneshot::Sender<Result<(), ReplicationError>>,
}

/// Replicates chat snapshots to peers via a fixed-size worker pool, matching
/// spec.md's "fixed-size worker pool consuming replication jobs; for each
/// job, fans out to up to N-1 peers" description (`REPLICATION_POOL_SIZE`).
/// Each worker handles one job's fan-out at a time; within a job, sends to
/// peers run concurrently, bounded by a semaphore sized off
/// `max_conns_per_peer`.
pub struct Replicator {
    tx: mpsc::Sender<ReplicationJob>,
}

impl Replicator {
    /// A single-worker pool — sufficient for tests and for the common case
    /// where callers serialize their own replicate calls; `spawn` is the
    /// real constructor for a service with `REPLICATION_POOL_SIZE` workers.
    pub fn new(client: Arc<dyn PeerClient>, max_conns_per_peer: usize) -> Self {
        Self::spawn(client, 1, max_conns_per_peer, 32)
    }

    /// Spawns `pool_size` worker tasks draining a shared job queue of
    /// capacity `queue_capacity`. `enqueue`'s caller (`replicate`) blocks
    /// until a worker dequeues its job and the job's reply arrives.
    pub fn spawn(client: Arc<dyn PeerClient>, pool_size: usize, max_conns_per_peer: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..pool_size.max(1) {
            let rx = rx.clone();
            let client = client.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        tracing::debug!(worker_id, "replicator worker shutting down");
                        break;
                    };
                    let result = fan_out(
                        &client,
                        max_conns_per_peer,
                        job.snapshot,
                        &job.preference_list,
                        job.n,
                        job.w,
                        job.max_errors,
                        job.timeout,
                    )
                    .await;
                    let _ = job.reply.send(result);
                }
            });
        }

        Self { tx }
    }

    /// Replicates `snapshot` to up to `n - 1` peers drawn from
    /// `preference_list` (the first entry is `self` and is skipped), gated
    /// by `w` acknowledgements within `timeout`. Queues the work onto the
    /// worker pool and waits for that job's outcome.
    pub async fn replicate(
        &self,
        snapshot: ChatSnapshot,
        preference_list: &[NodeId],
        n: usize,
        w: usize,
        max_errors: usize,
        timeout: Duration,
    ) -> Result<(), ReplicationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = ReplicationJob {
            snapshot,
            preference_list: preference_list.to_vec(),
            n,
            w,
            max_errors,
            timeout,
            reply: reply_tx,
        };
        self.tx
            .send(job)
            .await
            .map_err(|_| ReplicationError::Transport("replicator queue closed".into()))?;
        reply_rx.await.map_err(|_| ReplicationError::Transport("replicator worker dropped".into()))?
    }

    /// Subscribes to hashring membership changes and, for every
    /// locally-tracked chat this node was or is now primary for, fans a
    /// full snapshot out to any peer newly present in the preference list
    /// that wasn't there before — the mechanism by which a message held
    /// only in-memory during a failover reaches its new replicas, matching
    /// spec.md §4.5's ring-change catch-up rule. Runs until the hashring is
    /// dropped (its `watch::Sender` closes the subscription).
    pub fn spawn_ring_catchup(
        self: Arc<Self>,
        hashring: Arc<Hashring>,
        chats: Arc<ChatManager>,
        self_id: NodeId,
        n: usize,
        max_errors: usize,
        timeout: Duration,
    ) {
        tokio::spawn(async move {
            let mut rx = hashring.subscribe();
            let mut previous = rx.borrow().clone();
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                for chat in chats.all() {
                    let prev_pl: Vec<NodeId> = previous.preference_list(&chat.token).into_iter().take(n).collect();
                    let curr_pl: Vec<NodeId> = current.preference_list(&chat.token).into_iter().take(n).collect();
                    let was_primary = prev_pl.first() == Some(&self_id);
                    let is_primary = curr_pl.first() == Some(&self_id);
                    if (!was_primary && !is_primary) || prev_pl == curr_pl {
                        continue;
                    }

                    let new_peers: Vec<NodeId> = curr_pl
                        .iter()
                        .filter(|p| **p != self_id && !prev_pl.contains(p))
                        .cloned()
                        .collect();
                    if new_peers.is_empty() {
                        continue;
                    }

                    tracing::info!(
                        chat = %chat.token,
                        peers = new_peers.len(),
                        "ring changed; replicating full snapshot to new peers"
                    );
                    let snapshot = ChatSnapshot::full(&chat);
                    let synthetic_pl: Vec<NodeId> =
                        std::iter::once(self_id.clone()).chain(new_peers.into_iter()).collect();
                    let w = synthetic_pl.len();

                    let replicator = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            replicator.replicate(snapshot, &synthetic_pl, w, w, max_errors, timeout).await
                        {
                            tracing::warn!(%err, "ring-change catch-up replication failed");
                        }
                    });
                }
                previous = current;
            }
        });
    }
}

/// Does the actual quorum fan-out for one job: bounded concurrency via a
/// semaphore sized to `peers * max_conns_per_peer`, matching
/// `_coordinate_replication`'s `Semaphore(N-1)`.
async fn fan_out(
    client: &Arc<dyn PeerClient>,
    max_conns_per_peer: usize,
    snapshot: ChatSnapshot,
    preference_list: &[NodeId],
    n: usize,
    w: usize,
    max_errors: usize,
    timeout: Duration,
) -> Result<(), ReplicationError> {
    let peers: Vec<NodeId> = preference_list.iter().skip(1).take(n.saturating_sub(1)).cloned().collect();
    if peers.is_empty() {
        return if w <= 1 {
            Ok(())
        } else {
            Err(ReplicationError::QuorumFailed { successes: 1, w, n })
        };
    }

    let semaphore = Arc::new(Semaphore::new(peers.len().max(1) * max_conns_per_peer.max(1)));
    let (tx, mut rx) = mpsc::channel(peers.len().max(1));

    for peer in peers {
        let client = client.clone();
        let snapshot = snapshot.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = client.replicate(&peer, snapshot).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut counter = QuorumCounter::new(n, w, max_errors);
    // the implicit local write already counts as one success
    let mut state = counter.record_success();

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        state = match state {
            QuorumState::Satisfied => return Ok(()),
            QuorumState::Failed => {
                return Err(ReplicationError::QuorumFailed { successes: counter.successes, w, n })
            }
            QuorumState::Pending if counter.outstanding() == 0 => {
                return Err(ReplicationError::QuorumFailed { successes: counter.successes, w, n })
            }
            QuorumState::Pending => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(ReplicationError::Timeout);
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(Ok(()))) => counter.record_success(),
                    Ok(Some(Err(_))) => counter.record_failure(),
                    Ok(None) => return Err(ReplicationError::QuorumFailed { successes: counter.successes, w, n }),
                    Err(_) => return Err(ReplicationError::Timeout),
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl PeerClient for AlwaysOk {
        async fn replicate(&self, _node: &NodeId, _snapshot: ChatSnapshot) -> Result<(), ReplicationError> {
            Ok(())
        }
    }

    struct AlwaysErr;
    #[async_trait::async_trait]
    impl PeerClient for AlwaysErr {
        async fn replicate(&self, _node: &NodeId, _snapshot: ChatSnapshot) -> Result<(), ReplicationError> {
            Err(ReplicationError::Transport("boom".into()))
        }
    }

    struct CountingOk(Arc<AtomicUsize>);
    #[async_trait::async_trait]
    impl PeerClient for CountingOk {
        async fn replicate(&self, _node: &NodeId, _snapshot: ChatSnapshot) -> Result<(), ReplicationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn snapshot() -> ChatSnapshot {
        ChatSnapshot {
            chat_token: "c1".into(),
            start: None,
            end: None,
            users: std::collections::HashMap::new(),
            session: std::collections::HashMap::new(),
            persisted: false,
            messages: vec![],
            full_snapshot: true,
        }
    }

    fn prefs(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId(n.to_string())).collect()
    }

    #[tokio::test]
    async fn succeeds_when_w_reached() {
        let replicator = Replicator::new(Arc::new(AlwaysOk), 1);
        let out = replicator
            .replicate(snapshot(), &prefs(&["self", "b", "c"]), 3, 2, 2, Duration::from_secs(1))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn fails_when_errors_exceed_tolerance() {
        let replicator = Replicator::new(Arc::new(AlwaysErr), 1);
        let out = replicator
            .replicate(snapshot(), &prefs(&["self", "b", "c", "d"]), 4, 3, 1, Duration::from_secs(1))
            .await;
        assert!(out.is_err());
    }

    #[tokio::test]
    async fn single_node_ring_satisfies_w1() {
        let replicator = Replicator::new(Arc::new(AlwaysOk), 1);
        let out = replicator
            .replicate(snapshot(), &prefs(&["self"]), 1, 1, 2, Duration::from_secs(1))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn contacts_every_peer_in_preference_list() {
        let counter = Arc::new(AtomicUsize::new(0));
        let replicator = Replicator::new(Arc::new(CountingOk(counter.clone())), 1);
        let out = replicator
            .replicate(snapshot(), &prefs(&["self", "b", "c"]), 3, 1, 2, Duration::from_secs(1))
            .await;
        assert!(out.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
