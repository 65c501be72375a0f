//! Central request router. Grounded on `handler.py`'s `ChatServiceHandler`:
//! every RPC resolves the chat's current owner and either serves locally or
//! forwards to the owning peer, exactly once (no further hop-chasing — the
//! owner it forwards to is, by construction, authoritative for that token
//! at the instant the caller's hashring snapshot was taken).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::chat::{Chat, ChatManager, MessageDraft};
use crate::error::DispatchError;
use crate::hashring::{Hashring, NodeId};
use crate::message::{ChatStatus, Message, Payload, Route, UserStatus};
use crate::plugin::PluginRegistry;
use crate::replicator::{ChatSnapshot, Replicator};
use crate::persister::Persister;
use crate::time::now;

/// Forwards RPCs to a remote owner node. The production implementation is
/// the `reqwest`-based client in `rpc`; tests use an in-process fake that
/// calls straight into another `Dispatcher`.
#[async_trait::async_trait]
pub trait PeerForwarder: Send + Sync {
    async fn forward_send(
        &self,
        node: &NodeId,
        chat_token: &str,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<Message>, DispatchError>;

    async fn forward_get(
        &self,
        node: &NodeId,
        chat_token: &str,
        as_of: i64,
        block: bool,
        timeout: Duration,
        user_id: Option<String>,
    ) -> Result<Vec<Message>, DispatchError>;

    async fn forward_callback(
        &self,
        node: &NodeId,
        chat_token: &str,
        path: &str,
        params: HashMap<String, String>,
    ) -> Result<String, DispatchError>;
}

/// Quorum and timing parameters a `Dispatcher` applies to every send.
#[derive(Clone, Debug)]
pub struct ReplicationPolicy {
    pub n: usize,
    pub w: usize,
    pub max_errors: usize,
    pub timeout: Duration,
}

/// Registers path-keyed voice-callback handlers (the `twilioRequest`
/// surface). Ships empty; see SPEC_FULL.md §4.4.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: HashMap<String, Box<dyn Fn(&HashMap<String, String>) -> String + Send + Sync>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        handler: impl Fn(&HashMap<String, String>) -> String + Send + Sync + 'static,
    ) {
        self.handlers.insert(path.into(), Box::new(handler));
    }

    fn dispatch(&self, path: &str, params: &HashMap<String, String>) -> Result<String, DispatchError> {
        match self.handlers.get(path) {
            Some(handler) => Ok(handler(params)),
            None => Err(DispatchError::invalid_message(format!("no handler registered for path {path}"))),
        }
    }
}

pub struct Dispatcher {
    self_id: NodeId,
    hashring: Arc<Hashring>,
    chats: Arc<ChatManager>,
    registry: PluginRegistry,
    callbacks: CallbackRegistry,
    replicator: Arc<Replicator>,
    persister: Arc<Persister>,
    forwarder: Arc<dyn PeerForwarder>,
    policy: ReplicationPolicy,
    last_poll: AsyncMutex<HashMap<(String, String), i64>>,
    idle_threshold_secs: i64,
    default_long_poll_wait: Duration,
    dedup_by_host: bool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        hashring: Arc<Hashring>,
        chats: Arc<ChatManager>,
        registry: PluginRegistry,
        callbacks: CallbackRegistry,
        replicator: Arc<Replicator>,
        persister: Arc<Persister>,
        forwarder: Arc<dyn PeerForwarder>,
        policy: ReplicationPolicy,
        idle_threshold_secs: i64,
        default_long_poll_wait: Duration,
    ) -> Self {
        Self::with_dedup_by_host(
            self_id,
            hashring,
            chats,
            registry,
            callbacks,
            replicator,
            persister,
            forwarder,
            policy,
            idle_threshold_secs,
            default_long_poll_wait,
            true,
        )
    }

    /// As `new`, but with explicit control over `REPLICATION_ALLOW_SAME_HOST`
    /// (spec.md §4.1's `dedupByHost`): `dedup_by_host = true` means a
    /// preference list never places two peers on the same host back to back.
    #[allow(clippy::too_many_arguments)]
    pub fn with_dedup_by_host(
        self_id: NodeId,
        hashring: Arc<Hashring>,
        chats: Arc<ChatManager>,
        registry: PluginRegistry,
        callbacks: CallbackRegistry,
        replicator: Arc<Replicator>,
        persister: Arc<Persister>,
        forwarder: Arc<dyn PeerForwarder>,
        policy: ReplicationPolicy,
        idle_threshold_secs: i64,
        default_long_poll_wait: Duration,
        dedup_by_host: bool,
    ) -> Self {
        Self {
            self_id,
            hashring,
            chats,
            registry,
            callbacks,
            replicator,
            persister,
            forwarder,
            policy,
            last_poll: AsyncMutex::new(HashMap::new()),
            idle_threshold_secs,
            default_long_poll_wait,
            dedup_by_host,
        }
    }

    fn owner(&self, chat_token: &str) -> Result<(NodeId, Vec<NodeId>), DispatchError> {
        let ring = self.hashring.current();
        let prefs = ring.preference_list_with(chat_token, self.dedup_by_host);
        match prefs.first().cloned() {
            Some(owner) => Ok((owner, prefs)),
            None => Err(DispatchError::unavailable("no nodes available on the hashring")),
        }
    }

    /// `GetPreferenceList` RPC body: the deduplicated ordered owner list for
    /// `chat_token` under the live ring, applying this node's configured
    /// `dedup_by_host` policy.
    pub fn preference_list(&self, chat_token: &str) -> Vec<NodeId> {
        self.hashring.current().preference_list_with(chat_token, self.dedup_by_host)
    }

    /// `GetPreferenceList` wire body per spec.md §6: as `preference_list`,
    /// but each entry carries its matched ring token (`HashringNode`).
    pub fn preference_list_nodes(&self, chat_token: &str) -> Vec<crate::hashring::HashringNode> {
        self.hashring.current().preference_list_nodes_with(chat_token, self.dedup_by_host)
    }

    /// `GetHashring` RPC body: every claimed position on the live ring.
    pub fn current_ring_nodes(&self) -> Vec<NodeId> {
        self.hashring.current().nodes()
    }

    /// `GetHashring` wire body per spec.md §6: every claimed position,
    /// ordered by ring token.
    pub fn current_hashring_nodes(&self) -> Vec<crate::hashring::HashringNode> {
        self.hashring.current().hashring_nodes()
    }

    /// `SendMessage`: resolves the owner, forwards if remote, otherwise
    /// appends, plugin-dispatches, replicates to quorum, and persists if the
    /// chat just completed.
    #[tracing::instrument(skip(self, drafts))]
    pub async fn send_message(
        &self,
        chat_token: &str,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<Message>, DispatchError> {
        let (owner, prefs) = self.owner(chat_token)?;
        if owner != self.self_id {
            return self.forwarder.forward_send(&owner, chat_token, drafts).await;
        }

        let chat = self.chats.get_or_load(chat_token).await?;
        if chat.expired() {
            return Err(DispatchError::invalid_chat(format!("chat {chat_token} has expired")));
        }

        for draft in &drafts {
            default_pre_handle_draft(&chat, draft)?;
        }

        // Timestamp assignment, handler dispatch, and the final insert all
        // happen under one write-lock hold so a handler error aborts with
        // nothing appended (spec.md §7) and a concurrent send can't slip a
        // later-timestamped message in ahead of this one (spec.md §4.3).
        let guard = chat.begin_write();
        let ts = guard.ts;
        let primary = chat.build_messages(ts, drafts);

        let mut extra_drafts = Vec::new();
        for message in &primary {
            extra_drafts.extend(self.registry.handle(&chat, message)?);
        }
        // Single-level fan-out only: handler-emitted drafts are appended
        // alongside the triggering messages but never re-run through plugins.
        let mut to_commit = primary;
        to_commit.extend(chat.build_messages(ts, extra_drafts));

        let finalized = chat.commit_write(guard, to_commit);

        let snapshot = ChatSnapshot::incremental(&chat, finalized.clone());
        self.replicator
            .replicate(snapshot, &prefs, self.policy.n, self.policy.w, self.policy.max_errors, self.policy.timeout)
            .await?;

        if chat.completed() && !chat.persisted() {
            self.persister.persist(&chat).await.map_err(|e| DispatchError::unavailable(e.to_string()))?;
            let empty = ChatSnapshot::incremental(&chat, vec![]);
            let _ = self
                .replicator
                .replicate(empty, &prefs, self.policy.n, self.policy.w, self.policy.max_errors, self.policy.timeout)
                .await;
        }

        Ok(finalized)
    }

    /// `GetMessages`: resolves the owner, forwards if remote, otherwise
    /// long-polls locally. Also records the caller's poll time for idle
    /// detection (see `poll_idle_users`).
    #[tracing::instrument(skip(self))]
    pub async fn get_messages(
        &self,
        chat_token: &str,
        as_of: i64,
        block: bool,
        timeout: Option<Duration>,
        user_id: Option<String>,
    ) -> Result<Vec<Message>, DispatchError> {
        let timeout = timeout.unwrap_or(self.default_long_poll_wait);
        let (owner, _prefs) = self.owner(chat_token)?;
        if owner != self.self_id {
            return self.forwarder.forward_get(&owner, chat_token, as_of, block, timeout, user_id).await;
        }

        if let Some(user_id) = &user_id {
            let mut last_poll = self.last_poll.lock().await;
            last_poll.insert((chat_token.to_string(), user_id.clone()), now());
        }

        let chat = self.chats.get_or_load(chat_token).await?;
        Ok(chat.get_messages(as_of, block, timeout, user_id.as_deref()).await)
    }

    /// `Replicate`: applies an inbound snapshot from the primary. Called by
    /// the RPC layer when this node is a replica for `chat_token`.
    #[tracing::instrument(skip(self, snapshot))]
    pub fn replicate_inbound(&self, chat_token: &str, snapshot: ChatSnapshot) {
        let chat = self.chats.get_or_create(chat_token);
        chat.merge_replicated_state(snapshot.start, snapshot.end, snapshot.users, snapshot.session, snapshot.persisted);
        chat.store_replicated_messages(snapshot.messages);
    }

    /// `HandleCallback`: the `twilioRequest` surface, following the same
    /// forward-or-serve rule as every other RPC.
    pub async fn handle_callback(
        &self,
        chat_token: &str,
        path: &str,
        params: HashMap<String, String>,
    ) -> Result<String, DispatchError> {
        let (owner, _prefs) = self.owner(chat_token)?;
        if owner != self.self_id {
            return self.forwarder.forward_callback(&owner, chat_token, path, params).await;
        }
        self.callbacks.dispatch(path, &params)
    }

    /// Scans recorded poll times and emits a USER_STATUS UNAVAILABLE
    /// message for any user who hasn't polled within `idle_threshold_secs`,
    /// matching `handle_poll`'s idle-detection sweep. Intended to be called
    /// periodically alongside the garbage collector.
    pub async fn poll_idle_users(&self) {
        let threshold = now() - self.idle_threshold_secs;
        let idle: Vec<(String, String)> = {
            let last_poll = self.last_poll.lock().await;
            last_poll
                .iter()
                .filter(|(_, &ts)| ts < threshold)
                .map(|(key, _)| key.clone())
                .collect()
        };

        for (chat_token, user_id) in idle {
            let draft = MessageDraft {
                user_id: user_id.clone(),
                recipients: None,
                route: Route::Broadcast,
                client_timestamp: None,
                payload: Payload::UserStatus { user_id: user_id.clone(), status: UserStatus::Unavailable },
            };
            if let Err(err) = self.send_message(&chat_token, vec![draft]).await {
                tracing::warn!(%chat_token, %user_id, %err, "failed to emit idle status");
            }
            self.last_poll.lock().await.remove(&(chat_token, user_id));
        }
    }
}

/// Status-gating rule from spec.md §4.4 step 4: "status/marker messages are
/// always allowed; all others require STARTED and not ENDED."
fn default_pre_handle_draft(chat: &Chat, draft: &MessageDraft) -> Result<(), DispatchError> {
    let always_allowed =
        matches!(draft.payload, Payload::ChatStatus { .. } | Payload::UserStatus { .. } | Payload::MarkerCreate { .. });
    if !always_allowed && chat.status() != ChatStatus::Started {
        return Err(DispatchError::invalid_message(format!(
            "chat {} is not STARTED; rejecting {}",
            chat.token,
            draft.payload.kind()
        )));
    }
    if let Payload::UserStatus { user_id, status: UserStatus::Available } = &draft.payload {
        if !chat.has_participant(user_id) && chat.participant_count() >= chat.max_participants {
            return Err(DispatchError::invalid_message(format!(
                "chat {} is at its {} participant limit",
                chat.token,
                chat.max_participants
            )));
        }
    }
    Ok(())
}
