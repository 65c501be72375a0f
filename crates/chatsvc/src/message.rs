//! Message catalog. Mirrors `message.py`'s `MessageFactory`/`MessageEncoder`
//! split: a closed set of typed payloads plus the envelope fields every
//! message carries regardless of payload (route, timestamps, ids).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// How a message should be delivered to long-poll subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Delivered to every subscriber of the chat.
    Broadcast,
    /// Delivered to subscribers in the message's `recipients` set, dropped
    /// for everyone else.
    Targeted,
    /// Never delivered to long-poll subscribers (still stored/replicated).
    NoRoute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatStatus {
    Pending,
    Started,
    Ended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Disconnected,
    Available,
    Unavailable,
}

/// A chat participant's last-known presence, keyed by user id in
/// `Chat`'s `users` map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    pub status: UserStatus,
    pub update_timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerType {
    GenericMarker,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Marker {
    pub marker_type: MarkerType,
    pub data: serde_json::Value,
}

/// The closed set of message payloads. CHAT_STATUS and USER_STATUS carry
/// core-engine semantics (see `plugin::StatusHandler`); everything else is
/// opaque to the dispatcher and round-trips unchanged.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    ChatStatus { status: ChatStatus },
    UserStatus { user_id: String, status: UserStatus },
    MarkerCreate { marker_id: String, marker: Marker },
    MinuteCreate { minute_id: String, topic_id: String, start_timestamp: i64 },
    MinuteUpdate { minute_id: String, topic_id: String, start_timestamp: i64, end_timestamp: i64 },
    TagCreate { tag_id: String, minute_id: String, name: String, tag_reference_id: Option<String> },
    TagDelete { tag_id: String },
    WhiteboardCreate { whiteboard_id: String, name: String },
    WhiteboardDelete { whiteboard_id: String },
    WhiteboardCreatePath { whiteboard_id: String, path_id: String, path_data: String },
    WhiteboardDeletePath { whiteboard_id: String, path_id: String },
}

impl Payload {
    /// The discriminant used for plugin lookup and wire logging, independent
    /// of the payload's field shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::ChatStatus { .. } => "CHAT_STATUS",
            Payload::UserStatus { .. } => "USER_STATUS",
            Payload::MarkerCreate { .. } => "MARKER_CREATE",
            Payload::MinuteCreate { .. } => "MINUTE_CREATE",
            Payload::MinuteUpdate { .. } => "MINUTE_UPDATE",
            Payload::TagCreate { .. } => "TAG_CREATE",
            Payload::TagDelete { .. } => "TAG_DELETE",
            Payload::WhiteboardCreate { .. } => "WHITEBOARD_CREATE",
            Payload::WhiteboardDelete { .. } => "WHITEBOARD_DELETE",
            Payload::WhiteboardCreatePath { .. } => "WHITEBOARD_CREATE_PATH",
            Payload::WhiteboardDeletePath { .. } => "WHITEBOARD_DELETE_PATH",
        }
    }
}

/// A single message in a chat's timeline. `message_id` and `timestamp` are
/// assigned by the owning node at append time, never by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub recipients: Option<HashSet<String>>,
    pub route: Route,
    pub timestamp: i64,
    /// `clientTimestamp - timestamp` if the client supplied a timestamp at
    /// send time, else 0. Informational only; ordering always uses
    /// `timestamp`, the server-assigned value.
    pub skew: i64,
    pub payload: Payload,
}

impl Message {
    /// Whether `user_id` should see this message in its long-poll stream.
    pub fn visible_to(&self, user_id: &str) -> bool {
        match self.route {
            Route::NoRoute => false,
            Route::Broadcast => true,
            Route::Targeted => self.recipients.as_ref().is_some_and(|r| r.contains(user_id)),
        }
    }
}
