//! Handler plugin interface. The original `message_handlers/manager.py`
//! keeps a class-level registry populated by subclassing; this crate makes
//! that an explicit `PluginRegistry` built once at startup (see spec.md §9's
//! design note preferring explicit construction over global registration).

use std::collections::HashMap;
use std::sync::Arc;

use crate::chat::{Chat, MessageDraft};
use crate::error::PluginError;
use crate::message::{Message, Payload};

/// A plugin handling one or more message kinds (`Payload::kind()` strings).
/// `handle` runs after the dispatcher's default pre-handling (skew/timestamp
/// normalization, active-chat gating) and may reject the message, or emit
/// further drafts of its own — per spec.md §4.8, these are appended alongside
/// the triggering message but are not themselves rerun through plugins.
pub trait Handler: Send + Sync {
    fn handled_types(&self) -> &[&'static str];

    fn handle(&self, chat: &Chat, message: &Message) -> Result<Vec<MessageDraft>, PluginError>;
}

/// Routes an inbound message to the handler registered for its kind.
#[derive(Default)]
pub struct PluginRegistry {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every kind it claims in `handled_types`. The
    /// handler is reference-counted so it can be shared across multiple map
    /// entries without requiring `Handler: Clone`.
    pub fn register(&mut self, handler: impl Handler + 'static) {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        for kind in handler.handled_types() {
            self.handlers.insert(kind, handler.clone());
        }
    }

    fn dispatch(&self, chat: &Chat, message: &Message) -> Result<Vec<MessageDraft>, PluginError> {
        match self.handlers.get(message.payload.kind()) {
            Some(handler) => handler.handle(chat, message),
            None => Ok(Vec::new()),
        }
    }

    /// Runs the plugin registered for `message`'s type, if any, returning
    /// whatever extra drafts it emits. Registration order doesn't matter
    /// here since at most one handler is registered per type (see
    /// `register`'s "last handler for a kind wins" map semantics).
    pub fn handle(&self, chat: &Chat, message: &Message) -> Result<Vec<MessageDraft>, PluginError> {
        self.dispatch(chat, message)
    }
}

/// Handles CHAT_STATUS and USER_STATUS transitions. Grounded on
/// `message_handlers/status.py`: chat status only moves PENDING -> STARTED
/// -> ENDED (enforced upstream by `Chat::append_messages`'s
/// set-once-on-first-observation rule); user status just logs the
/// transition since per-user presence has no core-engine side effect beyond
/// the poll-driven UNAVAILABLE marker in `Dispatcher::handle_poll`.
pub struct StatusHandler;

impl Handler for StatusHandler {
    fn handled_types(&self) -> &[&'static str] {
        &["CHAT_STATUS", "USER_STATUS"]
    }

    fn handle(&self, chat: &Chat, message: &Message) -> Result<Vec<MessageDraft>, PluginError> {
        match &message.payload {
            Payload::ChatStatus { status } => {
                tracing::debug!(chat = %chat.token, ?status, "chat status transition");
                Ok(Vec::new())
            }
            Payload::UserStatus { user_id, status } => {
                tracing::debug!(chat = %chat.token, %user_id, ?status, "user status transition");
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// No-op handler for the message kinds that carry no core-engine semantics
/// (markers, minutes, tags, whiteboard events): they are stored, replicated,
/// and delivered, but the dispatcher has nothing to react to.
pub struct PassthroughHandler {
    kinds: Vec<&'static str>,
}

impl PassthroughHandler {
    pub fn new(kinds: Vec<&'static str>) -> Self {
        Self { kinds }
    }
}

impl Handler for PassthroughHandler {
    fn handled_types(&self) -> &[&'static str] {
        &self.kinds
    }

    fn handle(&self, _chat: &Chat, _message: &Message) -> Result<Vec<MessageDraft>, PluginError> {
        Ok(Vec::new())
    }
}

/// Builds the registry used at startup: `StatusHandler` for the two
/// core-semantic kinds, a single `PassthroughHandler` for the rest.
pub fn default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(StatusHandler);
    registry.register(PassthroughHandler::new(vec![
        "MARKER_CREATE",
        "MINUTE_CREATE",
        "MINUTE_UPDATE",
        "TAG_CREATE",
        "TAG_DELETE",
        "WHITEBOARD_CREATE",
        "WHITEBOARD_DELETE",
        "WHITEBOARD_CREATE_PATH",
        "WHITEBOARD_DELETE_PATH",
    ]));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChatStatus, Route};

    fn status_message(payload: Payload) -> Message {
        Message {
            message_id: "m1".into(),
            chat_id: "c1".into(),
            user_id: "alice".into(),
            recipients: None,
            route: Route::Broadcast,
            timestamp: 1,
            skew: 0,
            payload,
        }
    }

    #[test]
    fn registry_routes_status_to_status_handler() {
        let registry = default_registry();
        let chat = Chat::new("c1", 3600, 360);
        let msg = status_message(Payload::ChatStatus { status: ChatStatus::Started });
        assert!(registry.handle(&chat, &msg).is_ok());
    }

    #[test]
    fn registry_routes_unknown_kind_to_passthrough() {
        let registry = default_registry();
        let chat = Chat::new("c1", 3600, 360);
        let msg = status_message(Payload::TagDelete { tag_id: "t1".into() });
        assert!(registry.handle(&chat, &msg).is_ok());
    }
}
