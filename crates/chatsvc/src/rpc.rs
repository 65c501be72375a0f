//! RPC surface. A plain JSON/HTTP transport (`axum` server side, `reqwest`
//! client side) realizing the operation contracts of spec.md §6 — see
//! SPEC_FULL.md's ambient-stack note for why this crate uses that instead of
//! a codegen'd wire format. Node ids double as their own `host:port`
//! address, so no separate directory service is needed to turn a
//! `NodeId` into a URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::chat::MessageDraft;
use crate::dispatcher::{Dispatcher, PeerForwarder};
use crate::error::{DispatchError, ReplicationError};
use crate::hashring::{HashringNode, NodeId};
use crate::message::{Message, Payload, Route};
use crate::replicator::{ChatSnapshot, PeerClient};

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match self {
            DispatchError::Unavailable(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::InvalidChat(_) => axum::http::StatusCode::NOT_FOUND,
            DispatchError::InvalidMessage(_) => axum::http::StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Serialize, Deserialize)]
struct MessageDraftWire {
    user_id: String,
    recipients: Option<std::collections::HashSet<String>>,
    route: Route,
    #[serde(default)]
    client_timestamp: Option<i64>,
    payload: Payload,
}

impl From<MessageDraftWire> for MessageDraft {
    fn from(w: MessageDraftWire) -> Self {
        MessageDraft {
            user_id: w.user_id,
            recipients: w.recipients,
            route: w.route,
            client_timestamp: w.client_timestamp,
            payload: w.payload,
        }
    }
}

impl From<MessageDraft> for MessageDraftWire {
    fn from(d: MessageDraft) -> Self {
        MessageDraftWire {
            user_id: d.user_id,
            recipients: d.recipients,
            route: d.route,
            client_timestamp: d.client_timestamp,
            payload: d.payload,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SendRequest {
    chat_token: String,
    drafts: Vec<MessageDraftWire>,
}

#[derive(Serialize, Deserialize)]
struct GetRequest {
    chat_token: String,
    as_of: i64,
    block: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
    user_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ReplicateRequest {
    snapshot: ChatSnapshot,
}

#[derive(Serialize, Deserialize)]
struct CallbackRequest {
    chat_token: String,
    path: String,
    params: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ExpireSessionRequest {
    #[allow(dead_code)]
    timeout_secs: u64,
}

async fn send_message(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<Vec<Message>>, DispatchError> {
    let drafts = req.drafts.into_iter().map(Into::into).collect();
    let out = dispatcher.send_message(&req.chat_token, drafts).await?;
    Ok(Json(out))
}

async fn get_messages(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<GetRequest>,
) -> Result<Json<Vec<Message>>, DispatchError> {
    let out = dispatcher
        .get_messages(
            &req.chat_token,
            req.as_of,
            req.block,
            req.timeout_secs.map(Duration::from_secs),
            req.user_id,
        )
        .await?;
    Ok(Json(out))
}

#[derive(Serialize, Deserialize)]
struct PreferenceListRequest {
    chat_token: String,
}

/// `GetHashring`: every claimed position on the live ring, ordered by ring
/// token (lexicographic on the hex string, which is numeric order for a
/// fixed-width hex value).
async fn get_hashring(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Vec<HashringNode>> {
    Json(dispatcher.current_hashring_nodes())
}

async fn get_preference_list(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<PreferenceListRequest>,
) -> Json<Vec<HashringNode>> {
    Json(dispatcher.preference_list_nodes(&req.chat_token))
}

async fn replicate(State(dispatcher): State<Arc<Dispatcher>>, Json(req): Json<ReplicateRequest>) -> impl IntoResponse {
    dispatcher.replicate_inbound(&req.snapshot.chat_token.clone(), req.snapshot);
    axum::http::StatusCode::OK
}

async fn handle_callback(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<CallbackRequest>,
) -> Result<String, DispatchError> {
    dispatcher.handle_callback(&req.chat_token, &req.path, req.params).await
}

/// `ExpireSession`: a test-only hook for integration suites that need to
/// force a session boundary without waiting out a real timeout. A no-op in
/// production; it always reports success.
async fn expire_session(Json(_req): Json<ExpireSessionRequest>) -> Json<bool> {
    Json(true)
}

/// Builds the service's axum router. `/internal/replicate` is the
/// node-to-node path; the rest is the client-facing surface.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/rpc/send", post(send_message))
        .route("/rpc/get", post(get_messages))
        .route("/rpc/callback", post(handle_callback))
        .route("/rpc/expire_session", post(expire_session))
        .route("/rpc/hashring", post(get_hashring))
        .route("/rpc/preference_list", post(get_preference_list))
        .route("/internal/replicate", post(replicate))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// `reqwest`-based forwarder: turns a `NodeId` straight into a base URL.
pub struct ReqwestForwarder {
    client: reqwest::Client,
}

impl ReqwestForwarder {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn base_url(node: &NodeId) -> String {
        format!("http://{}", node.0)
    }
}

#[async_trait::async_trait]
impl PeerForwarder for ReqwestForwarder {
    async fn forward_send(
        &self,
        node: &NodeId,
        chat_token: &str,
        drafts: Vec<MessageDraft>,
    ) -> Result<Vec<Message>, DispatchError> {
        let req = SendRequest {
            chat_token: chat_token.to_string(),
            drafts: drafts.into_iter().map(Into::into).collect(),
        };
        self.client
            .post(format!("{}/rpc/send", Self::base_url(node)))
            .json(&req)
            .send()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))?
            .json::<Vec<Message>>()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))
    }

    async fn forward_get(
        &self,
        node: &NodeId,
        chat_token: &str,
        as_of: i64,
        block: bool,
        timeout: Duration,
        user_id: Option<String>,
    ) -> Result<Vec<Message>, DispatchError> {
        let req = GetRequest {
            chat_token: chat_token.to_string(),
            as_of,
            block,
            timeout_secs: Some(timeout.as_secs()),
            user_id,
        };
        self.client
            .post(format!("{}/rpc/get", Self::base_url(node)))
            .json(&req)
            .send()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))?
            .json::<Vec<Message>>()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))
    }

    async fn forward_callback(
        &self,
        node: &NodeId,
        chat_token: &str,
        path: &str,
        params: HashMap<String, String>,
    ) -> Result<String, DispatchError> {
        let req = CallbackRequest { chat_token: chat_token.to_string(), path: path.to_string(), params };
        self.client
            .post(format!("{}/rpc/callback", Self::base_url(node)))
            .json(&req)
            .send()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))?
            .text()
            .await
            .map_err(|e| DispatchError::unavailable(e.to_string()))
    }
}

/// `reqwest`-based peer client used by the `Replicator`.
pub struct ReqwestPeerClient {
    client: reqwest::Client,
}

impl ReqwestPeerClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PeerClient for ReqwestPeerClient {
    async fn replicate(&self, node: &NodeId, snapshot: ChatSnapshot) -> Result<(), ReplicationError> {
        let req = ReplicateRequest { snapshot };
        let resp = self
            .client
            .post(format!("http://{}/internal/replicate", node.0))
            .json(&req)
            .send()
            .await
            .map_err(|e| ReplicationError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ReplicationError::Transport(format!("peer returned {}", resp.status())))
        }
    }
}
