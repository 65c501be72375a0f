//! Error taxonomy. Module-level errors are `thiserror` enums; everything
//! that can reach an RPC boundary converts into [`DispatchError`].

/// Errors surfaced at the RPC boundary (see spec §7).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid chat: {0}")]
    InvalidChat(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl DispatchError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn invalid_chat(msg: impl Into<String>) -> Self {
        Self::InvalidChat(msg.into())
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat token unknown to metadata store: {0}")]
    NotFound(String),

    #[error("metadata store error: {0}")]
    Store(String),
}

impl From<ChatError> for DispatchError {
    fn from(err: ChatError) -> Self {
        DispatchError::InvalidChat(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("quorum not reached: {successes}/{w} required (of N={n})")]
    QuorumFailed { successes: usize, w: usize, n: usize },

    #[error("replication timed out")]
    Timeout,

    #[error("peer transport error: {0}")]
    Transport(String),
}

impl From<ReplicationError> for DispatchError {
    fn from(err: ReplicationError) -> Self {
        DispatchError::Unavailable(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("archive sink error: {0}")]
    Sink(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("{0}")]
    Rejected(String),
}

impl From<PluginError> for DispatchError {
    fn from(err: PluginError) -> Self {
        DispatchError::InvalidMessage(err.to_string())
    }
}
