//! `Chat` and `ChatManager`. Ground truth is `chat.py`: messages are stored
//! in timestamp order behind a short critical section (timestamp assignment
//! and insertion happen together, synchronously, so a concurrent append can
//! never observe a message with a timestamp but no slot or vice versa), and
//! new-message delivery is a broadcast "pulse" rather than a latched value —
//! exactly the `self.self.messages`-typo'd `get_messages` in the original,
//! which this crate fixes quietly (see DESIGN.md) while keeping its
//! block-then-recompute-once shape.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::ChatError;
use crate::message::{ChatStatus, Message, Payload, Route, UserState};
use crate::time::now;

/// Whether a `Chat`'s backing metadata record has finished its async load.
/// `Failed` is terminal: `ChatManager::get_or_load` removes the entry so a
/// later call re-attempts the load rather than wedging forever on a chat
/// token the metadata store will never recognize.
#[derive(Clone)]
enum LoadState {
    Pending,
    Loaded,
    Failed(String),
}

struct ChatInner {
    messages: Vec<Message>,
    message_ids: std::collections::HashSet<String>,
    load_state: LoadState,
    id: Option<i64>,
    start: Option<i64>,
    end: Option<i64>,
    persisted: bool,
    users: HashMap<String, UserState>,
    session: HashMap<String, serde_json::Value>,
}

/// A single chat's timeline and lifecycle state. Cheap to hold as
/// `Arc<Chat>`; the only mutable state lives behind `inner`, locked only
/// across the synchronous append, never across an `.await`.
pub struct Chat {
    pub token: String,
    pub max_duration_secs: i64,
    pub expiration_grace_secs: i64,
    pub max_participants: usize,
    inner: StdMutex<ChatInner>,
    /// Serializes the assign-timestamp -> handler-dispatch -> insert sequence
    /// per chat (see `begin_write`), distinct from `inner`'s lock so a
    /// handler invoked mid-write can still call back into `Chat`'s read
    /// accessors without deadlocking.
    write_lock: StdMutex<()>,
    /// Pulsed (not latched) on every append. Waiters call
    /// `receiver.changed().await`; a waiter that subscribes after the pulse
    /// waits for the *next* one, matching spec.md's documented limitation.
    signal: watch::Sender<()>,
    /// Pulsed once, the first time the chat's backing record is loaded.
    loaded_signal: watch::Sender<()>,
}

impl Chat {
    pub fn new(token: impl Into<String>, max_duration_secs: i64, expiration_grace_secs: i64) -> Self {
        Self::with_max_participants(token, max_duration_secs, expiration_grace_secs, usize::MAX)
    }

    pub fn with_max_participants(
        token: impl Into<String>,
        max_duration_secs: i64,
        expiration_grace_secs: i64,
        max_participants: usize,
    ) -> Self {
        let (signal, _) = watch::channel(());
        let (loaded_signal, _) = watch::channel(());
        Self {
            token: token.into(),
            max_duration_secs,
            expiration_grace_secs,
            max_participants,
            inner: StdMutex::new(ChatInner {
                messages: Vec::new(),
                message_ids: std::collections::HashSet::new(),
                load_state: LoadState::Pending,
                id: None,
                start: None,
                end: None,
                persisted: false,
                users: HashMap::new(),
                session: HashMap::new(),
            }),
            write_lock: StdMutex::new(()),
            signal,
            loaded_signal,
        }
    }

    /// Marks the chat as loaded (its metadata record has been fetched from
    /// the external store) and pulses anyone blocked in `wait_loaded`.
    /// `id` is the numeric database id the metadata store assigned this
    /// chat token, populated per spec.md §3's data model.
    pub fn mark_loaded(&self, id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.load_state, LoadState::Loaded) {
            inner.load_state = LoadState::Loaded;
            inner.id = Some(id);
            drop(inner);
            let _ = self.loaded_signal.send(());
        }
    }

    /// Marks the load as having failed — the metadata store doesn't
    /// recognize this token, or errored. Terminal for this `Chat` instance;
    /// `ChatManager::get_or_load` drops the entry afterward so a later call
    /// builds a fresh one and retries, matching spec.md §7's "leave the Chat
    /// unloaded (future get() retries)" propagation policy.
    fn mark_load_failed(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.load_state = LoadState::Failed(reason.into());
        drop(inner);
        let _ = self.loaded_signal.send(());
    }

    pub fn loaded(&self) -> bool {
        matches!(self.inner.lock().unwrap().load_state, LoadState::Loaded)
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.lock().unwrap().id
    }

    /// Blocks until the chat's metadata load reaches a terminal state,
    /// returning the same error every other concurrent waiter sees if the
    /// load failed.
    pub async fn wait_loaded(&self) -> Result<(), ChatError> {
        // Subscribe before the first check: any pulse sent after this point,
        // even one racing with the lock check below, still bumps the
        // channel's version past what `rx` has seen, so the eventual
        // `rx.changed().await` can't miss it.
        let mut rx = self.loaded_signal.subscribe();
        loop {
            {
                let inner = self.inner.lock().unwrap();
                match &inner.load_state {
                    LoadState::Loaded => return Ok(()),
                    LoadState::Failed(reason) => return Err(ChatError::NotFound(reason.clone())),
                    LoadState::Pending => {}
                }
            }
            let _ = rx.changed().await;
        }
    }

    pub fn started(&self) -> bool {
        self.inner.lock().unwrap().start.is_some()
    }

    pub fn ended(&self) -> bool {
        self.inner.lock().unwrap().end.is_some()
    }

    pub fn completed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.start.is_some() && inner.end.is_some()
    }

    pub fn persisted(&self) -> bool {
        self.inner.lock().unwrap().persisted
    }

    pub fn start(&self) -> Option<i64> {
        self.inner.lock().unwrap().start
    }

    pub fn end(&self) -> Option<i64> {
        self.inner.lock().unwrap().end
    }

    pub fn mark_persisted(&self) {
        self.inner.lock().unwrap().persisted = true;
    }

    /// Derived from `start`/`end`, matching the monotonic PENDING → STARTED
    /// → ENDED advance `append_messages`/`apply_status` enforce.
    pub fn status(&self) -> ChatStatus {
        let inner = self.inner.lock().unwrap();
        match (inner.start, inner.end) {
            (Some(_), Some(_)) => ChatStatus::Ended,
            (Some(_), None) => ChatStatus::Started,
            (None, _) => ChatStatus::Pending,
        }
    }

    pub fn users(&self) -> HashMap<String, UserState> {
        self.inner.lock().unwrap().users.clone()
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.inner.lock().unwrap().users.contains_key(user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().unwrap().users.len()
    }

    pub fn session(&self) -> HashMap<String, serde_json::Value> {
        self.inner.lock().unwrap().session.clone()
    }

    pub fn session_set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().unwrap().session.insert(key.into(), value);
    }

    /// Applies a peer-sent `ChatSnapshot`'s scalar fields, overwriting this
    /// node's view wholesale (the peer is, by construction, the chat's
    /// current or former primary). Messages are merged separately via
    /// `store_replicated_messages`.
    pub fn merge_replicated_state(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        users: HashMap<String, UserState>,
        session: HashMap<String, serde_json::Value>,
        persisted: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.start = start;
        inner.end = end;
        inner.users = users;
        inner.session = session;
        inner.persisted = inner.persisted || persisted;
    }

    /// True once `now` is past `start + maxDuration + grace` and the chat
    /// never ended cleanly — the zombie-detection condition in
    /// `garbage.py`.
    pub fn expired(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.start {
            Some(start) if inner.end.is_none() => {
                now() > start + self.max_duration_secs + self.expiration_grace_secs
            }
            _ => false,
        }
    }

    /// Appends locally-originated messages: assigns `message_id` and
    /// `timestamp` synchronously (no `.await` between assignment and
    /// insertion), updates chat status bookkeeping, then pulses waiters.
    /// Returns the finalized messages in the order applied. A thin wrapper
    /// around `begin_write`/`build_messages`/`commit_write` for callers (most
    /// tests, replication catch-up, GC) that have no handler plugins to run
    /// in between; `Dispatcher::send_message` uses the split form directly so
    /// handler errors can abort before anything is inserted.
    pub fn append_messages(&self, drafts: Vec<MessageDraft>) -> Vec<Message> {
        let guard = self.begin_write();
        let ts = guard.ts;
        let built = self.build_messages(ts, drafts);
        self.commit_write(guard, built)
    }

    /// Acquires the chat's single-writer lock and fixes the timestamp this
    /// write batch will use. Holding the guard across handler dispatch
    /// (synchronous, no `.await`) keeps a concurrent send from slipping a
    /// later-timestamped message in before this one commits, which would
    /// violate the chat's timestamp-ordering invariant.
    pub fn begin_write(&self) -> ChatWriteGuard<'_> {
        let guard = self.write_lock.lock().unwrap();
        ChatWriteGuard { _guard: guard, ts: now() }
    }

    /// Builds `Message`s from `drafts` at `ts`, without touching any stored
    /// state. Pure aside from generating fresh ids.
    pub fn build_messages(&self, ts: i64, drafts: Vec<MessageDraft>) -> Vec<Message> {
        drafts
            .into_iter()
            .map(|draft| {
                let skew = draft.client_timestamp.map(|client_ts| client_ts - ts).unwrap_or(0);
                Message {
                    message_id: Uuid::new_v4().to_string(),
                    chat_id: self.token.clone(),
                    user_id: draft.user_id,
                    recipients: draft.recipients,
                    route: draft.route,
                    timestamp: ts,
                    skew,
                    payload: draft.payload,
                }
            })
            .collect()
    }

    /// Inserts `messages` (built via `build_messages` under this same
    /// `guard`), applies status bookkeeping, and pulses waiters. Consumes the
    /// guard, so a given `begin_write` can only ever be committed once.
    pub fn commit_write(&self, _guard: ChatWriteGuard<'_>, messages: Vec<Message>) -> Vec<Message> {
        let mut finalized = Vec::with_capacity(messages.len());
        {
            let mut inner = self.inner.lock().unwrap();
            for message in messages {
                // Freshly-minted UUIDs collide only in theory, but the
                // dedup rule is universal: a message id already present is
                // ignored rather than appended again.
                if !inner.message_ids.insert(message.message_id.clone()) {
                    continue;
                }
                apply_status(&mut inner, &message, message.timestamp);
                inner.messages.push(message.clone());
                finalized.push(message);
            }
        }
        let _ = self.signal.send(());
        finalized
    }

    /// Stores messages received via replication. Trusts the sender's
    /// timestamps; never pulses (replicated messages are not "new" from a
    /// long-poll subscriber's perspective on this node — they were already
    /// delivered by the primary before replication completed). Idempotent:
    /// a message id already present is silently skipped, so re-applying the
    /// same snapshot twice leaves the chat state unchanged the second time.
    pub fn store_replicated_messages(&self, messages: Vec<Message>) {
        let mut inner = self.inner.lock().unwrap();
        for message in messages {
            if inner.message_ids.contains(&message.message_id) {
                continue;
            }
            inner.message_ids.insert(message.message_id.clone());
            apply_status(&mut inner, &message, message.timestamp);
            insert_sorted(&mut inner.messages, message);
        }
    }

    /// Messages with `timestamp > as_of`, visible to `user_id` if given. With
    /// no `user_id` (an anonymous read), only the `NO_ROUTE` filter applies —
    /// per spec.md §3/§4.3, `NO_ROUTE` messages are stored but never
    /// delivered to any reader, named or anonymous.
    fn messages_since(&self, as_of: i64, user_id: Option<&str>) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        let idx = inner.messages.partition_point(|m| m.timestamp <= as_of);
        inner.messages[idx..]
            .iter()
            .filter(|m| match user_id {
                Some(u) => m.visible_to(u),
                None => m.route != Route::NoRoute,
            })
            .cloned()
            .collect()
    }

    /// All messages ever stored, visible to `user_id` if given. Used to
    /// build replication/archive snapshots.
    pub fn all_messages(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Wakes every current long-poll waiter without appending anything, per
    /// spec.md §4.3. Used on shutdown (via `ChatManager::trigger_all`) so
    /// outstanding `get_messages` calls return instead of riding out their
    /// full timeout.
    pub fn pulse(&self) {
        let _ = self.signal.send(());
    }

    /// `GetMessages` semantics: return messages since `as_of`. If none are
    /// available yet and `block` is set, wait for the next pulse (or
    /// `timeout`) and recompute exactly once — matching the original's
    /// single re-check rather than a retry loop, which bounds how long a
    /// caller can be kept waiting past `timeout`.
    pub async fn get_messages(
        &self,
        as_of: i64,
        block: bool,
        timeout: Duration,
        user_id: Option<&str>,
    ) -> Vec<Message> {
        let first = self.messages_since(as_of, user_id);
        if !first.is_empty() || !block {
            return first;
        }
        let mut rx = self.signal.subscribe();
        let _ = tokio::time::timeout(timeout, rx.changed()).await;
        self.messages_since(as_of, user_id)
    }
}

/// Held across `Chat::begin_write`/`build_messages`/`commit_write`. The
/// inner guard is never read, only held, so dropping it (on early return) is
/// what actually releases the write lock.
pub struct ChatWriteGuard<'a> {
    _guard: std::sync::MutexGuard<'a, ()>,
    pub ts: i64,
}

/// A message not yet assigned an id or timestamp, produced by the
/// dispatcher/plugins before handing off to `Chat::append_messages`.
pub struct MessageDraft {
    pub user_id: String,
    pub recipients: Option<std::collections::HashSet<String>>,
    pub route: crate::message::Route,
    /// Timestamp the client claims to have sent at, if any. Never trusted
    /// for ordering — only used to compute `Message::skew` for diagnostics.
    pub client_timestamp: Option<i64>,
    pub payload: Payload,
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let idx = messages.partition_point(|m| m.timestamp <= message.timestamp);
    messages.insert(idx, message);
}

fn apply_status(inner: &mut ChatInner, message: &Message, ts: i64) {
    match &message.payload {
        Payload::ChatStatus { status } => match status {
            ChatStatus::Started if inner.start.is_none() => inner.start = Some(ts),
            ChatStatus::Ended if inner.end.is_none() => inner.end = Some(ts),
            _ => {}
        },
        Payload::UserStatus { user_id, status } => {
            inner.users.insert(user_id.clone(), UserState { status: *status, update_timestamp: ts });
        }
        _ => {}
    }
}

/// The chat record a `MetadataStore` hands back for a recognized token.
/// Just the id for now — spec.md §3 names it as the one field populated by
/// the metadata load that `Chat` doesn't already know at construction time.
pub struct ChatMetadata {
    pub id: i64,
}

/// The external metadata-store boundary from spec.md §4.2: "trigger async
/// metadata load on first creation ... fail with InvalidChat if the token is
/// not in the metadata store." An external collaborator per spec.md §1, so
/// this crate ships only the trait plus fakes (mirrors `ArchiveSink`/
/// `MembershipWatcher`).
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load(&self, token: &str) -> Result<ChatMetadata, ChatError>;
}

/// Recognizes every token, handing out sequential ids. The out-of-the-box
/// default (see `main.rs`): a real deployment backs `ChatManager` with a
/// store that actually checks a database, but nothing in this crate's scope
/// requires one to exist for the service to run.
#[derive(Default)]
pub struct AllowAllMetadataStore {
    next_id: std::sync::atomic::AtomicI64,
}

#[async_trait::async_trait]
impl MetadataStore for AllowAllMetadataStore {
    async fn load(&self, _token: &str) -> Result<ChatMetadata, ChatError> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(ChatMetadata { id })
    }
}

/// Owns the live set of in-memory `Chat`s, keyed by token. Lock is only ever
/// held across a map lookup/insert, never across chat I/O — matching
/// spec.md §4.2's "short-held map lock" requirement.
pub struct ChatManager {
    chats: StdMutex<std::collections::HashMap<String, std::sync::Arc<Chat>>>,
    metadata: std::sync::Arc<dyn MetadataStore>,
    max_duration_secs: i64,
    expiration_grace_secs: i64,
    max_participants: usize,
}

impl ChatManager {
    pub fn new(max_duration_secs: i64, expiration_grace_secs: i64) -> Self {
        Self::with_max_participants(max_duration_secs, expiration_grace_secs, usize::MAX)
    }

    pub fn with_max_participants(max_duration_secs: i64, expiration_grace_secs: i64, max_participants: usize) -> Self {
        Self::with_metadata_store(
            max_duration_secs,
            expiration_grace_secs,
            max_participants,
            std::sync::Arc::new(AllowAllMetadataStore::default()),
        )
    }

    pub fn with_metadata_store(
        max_duration_secs: i64,
        expiration_grace_secs: i64,
        max_participants: usize,
        metadata: std::sync::Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            chats: StdMutex::new(std::collections::HashMap::new()),
            metadata,
            max_duration_secs,
            expiration_grace_secs,
            max_participants,
        }
    }

    /// Returns the chat for `token`, creating it on first reference.
    /// Idempotent under concurrent callers: only one `Chat` is ever
    /// constructed per token. Does not go through the metadata store —
    /// callers get an immediately-usable `Chat` with no load to wait on.
    /// Used internally (replication inbound, GC, tests) where the token is
    /// already known-good by construction; RPC entry points use
    /// `get_or_load` instead so an unrecognized token surfaces `InvalidChat`.
    pub fn get_or_create(&self, token: &str) -> std::sync::Arc<Chat> {
        let mut chats = self.chats.lock().unwrap();
        chats
            .entry(token.to_string())
            .or_insert_with(|| {
                let chat = Chat::with_max_participants(
                    token,
                    self.max_duration_secs,
                    self.expiration_grace_secs,
                    self.max_participants,
                );
                chat.mark_loaded(0);
                std::sync::Arc::new(chat)
            })
            .clone()
    }

    /// Returns the chat for `token`, triggering (and waiting on) an async
    /// metadata load the first time this token is referenced, per spec.md
    /// §4.2. Concurrent callers racing the same new token all wait on the
    /// same load; only one of them actually performs it. A load failure
    /// removes the entry so a later call retries from scratch, matching
    /// spec.md §7's propagation policy.
    pub async fn get_or_load(&self, token: &str) -> Result<std::sync::Arc<Chat>, ChatError> {
        let (chat, created) = {
            let mut chats = self.chats.lock().unwrap();
            if let Some(existing) = chats.get(token) {
                (existing.clone(), false)
            } else {
                let chat = std::sync::Arc::new(Chat::with_max_participants(
                    token,
                    self.max_duration_secs,
                    self.expiration_grace_secs,
                    self.max_participants,
                ));
                chats.insert(token.to_string(), chat.clone());
                (chat, true)
            }
        };

        if !created {
            chat.wait_loaded().await?;
            return Ok(chat);
        }

        match self.metadata.load(token).await {
            Ok(meta) => {
                chat.mark_loaded(meta.id);
                Ok(chat)
            }
            Err(err) => {
                chat.mark_load_failed(err.to_string());
                self.chats.lock().unwrap().remove(token);
                Err(err)
            }
        }
    }

    pub fn get(&self, token: &str) -> Option<std::sync::Arc<Chat>> {
        self.chats.lock().unwrap().get(token).cloned()
    }

    pub fn remove(&self, token: &str) -> Option<std::sync::Arc<Chat>> {
        self.chats.lock().unwrap().remove(token)
    }

    pub fn all(&self) -> Vec<std::sync::Arc<Chat>> {
        self.chats.lock().unwrap().values().cloned().collect()
    }

    /// Wakes every chat's `messageSignal`, per spec.md §4.2. Called once
    /// during shutdown so long-poll callers see their `GetMessages` resolve
    /// (with whatever's currently available) rather than blocking until the
    /// server has already stopped accepting connections.
    pub fn trigger_all(&self) {
        for chat in self.chats.lock().unwrap().values() {
            chat.pulse();
        }
    }
}
