//! Durable-archive handoff. Grounded on `persistence.py`'s `Persister`/
//! `GreenletPoolPersister`: a bounded worker pool drains an enqueue channel
//! and hands each completed chat to an external sink exactly once.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::chat::Chat;
use crate::error::PersistError;
use crate::time::now;

/// A row handed to the durable archive store: `{chatId, created, notBefore,
/// data, retriesRemaining}`. `not_before` defaults to the job's creation
/// time; the core never reschedules it, it exists so the external store's
/// retry scheduler has something to key off, matching `_persist_item`'s
/// documented contract. `data` is the chat's `session` map, serialized as a
/// JSON object rather than the raw message log.
#[derive(Clone, Debug)]
pub struct ArchiveJob {
    pub chat_token: String,
    pub data: serde_json::Value,
    pub created: i64,
    pub not_before: i64,
    pub retries_remaining: u32,
}

impl ArchiveJob {
    pub fn new(chat_token: impl Into<String>, session: std::collections::HashMap<String, serde_json::Value>) -> Self {
        let created = now();
        Self {
            chat_token: chat_token.into(),
            data: serde_json::Value::Object(decode_nested_json_strings(session)),
            created,
            not_before: created,
            retries_remaining: 4,
        }
    }
}

/// Session values are sometimes stashed as JSON-encoded strings rather than
/// real JSON (a plugin calling `session_set` with an already-serialized
/// blob) — `twilio_data` in particular, per spec.md §6. Decode any such
/// string back into real JSON before it's archived, so the archive row
/// carries structured data rather than a doubly-escaped string. Fields that
/// aren't valid JSON strings pass through unchanged.
fn decode_nested_json_strings(
    session: std::collections::HashMap<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    session
        .into_iter()
        .map(|(key, value)| {
            let decoded = match &value {
                serde_json::Value::String(s) if key == "twilio_data" => {
                    serde_json::from_str(s).unwrap_or(value.clone())
                }
                _ => value,
            };
            (key, decoded)
        })
        .collect()
}

/// The durable store boundary. Spec.md treats this as an external
/// collaborator; this crate ships only the trait plus a test fake.
#[async_trait::async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn archive(&self, job: ArchiveJob) -> Result<(), PersistError>;
}

/// Records every job it receives, for test assertions.
#[derive(Default)]
pub struct RecordingArchiveSink {
    jobs: std::sync::Mutex<Vec<ArchiveJob>>,
}

impl RecordingArchiveSink {
    pub fn jobs(&self) -> Vec<ArchiveJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ArchiveSink for RecordingArchiveSink {
    async fn archive(&self, job: ArchiveJob) -> Result<(), PersistError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

/// A bounded pool of persist workers, matching `automations::server`'s
/// semaphore-gated worker-pool shape. `enqueue` never blocks the caller
/// beyond the channel's configured capacity.
pub struct Persister {
    tx: mpsc::Sender<ArchiveJob>,
}

impl Persister {
    /// Spawns `pool_size` worker tasks draining the enqueue channel and
    /// calling `sink.archive` for each job. At-most-once: a chat is
    /// persisted exactly when its `ChatManager` entry is removed by the
    /// caller after a successful `persist()` call (see `dispatcher`/`gc`).
    pub fn spawn(sink: Arc<dyn ArchiveSink>, pool_size: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let semaphore = Arc::new(Semaphore::new(pool_size));

        for worker_id in 0..pool_size {
            let rx = rx.clone();
            let sink = sink.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        tracing::debug!(worker_id, "persister worker shutting down");
                        break;
                    };
                    let _permit = semaphore.acquire().await;
                    let chat_token = job.chat_token.clone();
                    if let Err(err) = sink.archive(job).await {
                        tracing::warn!(%chat_token, %err, "archive failed");
                    }
                }
            });
        }

        Self { tx }
    }

    /// Enqueues a chat for archival. Called once a chat is observed
    /// complete (see `gc`/`dispatcher`), matching `_persist_observer`'s
    /// "final replicate([]) on persisted" companion step, which the
    /// dispatcher performs after this call returns.
    pub async fn enqueue(&self, job: ArchiveJob) -> Result<(), PersistError> {
        self.tx
            .send(job)
            .await
            .map_err(|_| PersistError::Sink("persister queue closed".into()))
    }

    /// Builds and enqueues an archive job from a chat's current message
    /// set.
    pub async fn persist(&self, chat: &Chat) -> Result<(), PersistError> {
        let job = ArchiveJob::new(chat.token.clone(), chat.session());
        self.enqueue(job).await?;
        chat.mark_persisted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatStatus, Payload, Route};

    #[tokio::test]
    async fn persist_forwards_job_to_sink() {
        let sink = Arc::new(RecordingArchiveSink::default());
        let persister = Persister::spawn(sink.clone(), 2, 10);

        let chat = Chat::new("c1", 3600, 360);
        chat.append_messages(vec![crate::chat::MessageDraft {
            user_id: "alice".into(),
            recipients: None,
            route: Route::Broadcast,
            client_timestamp: None,
            payload: Payload::ChatStatus { status: ChatStatus::Started },
        }]);
        chat.session_set("twilio_data", serde_json::json!({"from": "+15550100"}));

        persister.persist(&chat).await.unwrap();
        assert!(chat.persisted());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let jobs = sink.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].chat_token, "c1");
        assert_eq!(jobs[0].retries_remaining, 4);
        assert_eq!(jobs[0].not_before, jobs[0].created);
        assert_eq!(jobs[0].data["twilio_data"]["from"], "+15550100");
    }

    #[test]
    fn twilio_data_json_encoded_string_is_decoded() {
        let mut session = std::collections::HashMap::new();
        session.insert("twilio_data".to_string(), serde_json::Value::String(r#"{"from":"+15550100"}"#.into()));
        session.insert("other".to_string(), serde_json::Value::String("plain string".into()));

        let job = ArchiveJob::new("c1", session);
        assert_eq!(job.data["twilio_data"]["from"], "+15550100");
        assert_eq!(job.data["other"], "plain string");
    }
}
