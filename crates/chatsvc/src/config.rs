//! Runtime configuration. A single typed struct with environment overrides,
//! in the spirit of the teacher's `agent::Args` (clap derive + `env`), taking
//! the place of the original service's layered `default_settings.py` →
//! `{prod,staging,test}_settings.py` module-import settings.

use std::time::Duration;

#[derive(Clone, Debug, clap::Parser)]
#[clap(author, version, about = "Distributed in-memory chat message service")]
pub struct Config {
    /// Address to bind the HTTP RPC server to.
    #[clap(long, env = "CHATSVC_BIND_ADDR", default_value = "0.0.0.0:7070")]
    pub bind_addr: String,

    /// Hostname other nodes should use to reach us. Defaults to the bind
    /// address's host if unset.
    #[clap(long, env = "CHATSVC_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Number of virtual positions each node claims on the hashring.
    #[clap(long, env = "HASHRING_POSITIONS_PER_NODE", default_value_t = 3)]
    pub hashring_positions_per_node: usize,

    /// Total desired replica count (including the local copy), used when a
    /// caller omits N.
    #[clap(long, env = "REPLICATION_N", default_value_t = 2)]
    pub replication_n: usize,

    /// Replicas required before acknowledging a write, used when a caller
    /// omits W.
    #[clap(long, env = "REPLICATION_W", default_value_t = 1)]
    pub replication_w: usize,

    /// Number of worker tasks in the replication pool.
    #[clap(long, env = "REPLICATION_POOL_SIZE", default_value_t = 20)]
    pub replication_pool_size: usize,

    /// How long a `SendMessage` call waits for quorum before failing.
    #[clap(long, env = "REPLICATION_TIMEOUT_SECS", default_value_t = 5)]
    pub replication_timeout_secs: u64,

    /// Maximum number of errors tolerated before a replication job fails,
    /// beyond which it fails regardless of remaining sends.
    #[clap(long, env = "REPLICATION_MAX_ERRORS", default_value_t = 2)]
    pub replication_max_errors: usize,

    /// Maximum open connections per peer service.
    #[clap(long, env = "REPLICATION_MAX_CONNS_PER_PEER", default_value_t = 1)]
    pub replication_max_conns_per_peer: usize,

    /// Whether replication may target a second peer on the same host.
    #[clap(long, env = "REPLICATION_ALLOW_SAME_HOST", default_value_t = false)]
    pub replication_allow_same_host: bool,

    /// Number of worker tasks in the persist pool.
    #[clap(long, env = "PERSIST_POOL_SIZE", default_value_t = 4)]
    pub persist_pool_size: usize,

    /// Maximum simultaneous participants per chat.
    #[clap(long, env = "CHAT_MAX_PARTICIPANTS", default_value_t = 50)]
    pub chat_max_participants: usize,

    /// Default long-poll wait for `GetMessages(block=true)`.
    #[clap(long, env = "LONG_POLL_WAIT_SECS", default_value_t = 10)]
    pub long_poll_wait_secs: u64,

    /// Seconds of polling silence after which a user is marked UNAVAILABLE.
    #[clap(long, env = "IDLE_THRESHOLD_SECS", default_value_t = 20)]
    pub idle_threshold_secs: i64,

    /// Grace period past `endTimestamp + maxDuration` before a chat is
    /// considered expired.
    #[clap(long, env = "EXPIRATION_GRACE_SECS", default_value_t = 360)]
    pub expiration_grace_secs: i64,

    /// Garbage-collector sweep interval.
    #[clap(long, env = "GC_INTERVAL_SECS", default_value_t = 60)]
    pub gc_interval_secs: u64,

    /// Per-chat throttle within a single GC sweep.
    #[clap(long, env = "GC_THROTTLE_MILLIS", default_value_t = 100)]
    pub gc_throttle_millis: u64,

    /// Bound on the replication/persist job queues.
    #[clap(long, env = "QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,
}

impl Config {
    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication_timeout_secs)
    }

    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_secs(self.long_poll_wait_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn gc_throttle(&self) -> Duration {
        Duration::from_millis(self.gc_throttle_millis)
    }
}
