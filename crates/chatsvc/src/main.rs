use std::sync::Arc;

use clap::Parser;
use futures::FutureExt;

use chatsvc::chat::ChatManager;
use chatsvc::config::Config;
use chatsvc::dispatcher::{Dispatcher, ReplicationPolicy};
use chatsvc::gc::{GarbageCollector, LoggingZombieObserver};
use chatsvc::hashring::{Hashring, NodeId};
use chatsvc::membership::{MembershipWatcher, StaticMembership};
use chatsvc::persister::{Persister, RecordingArchiveSink};
use chatsvc::plugin::default_registry;
use chatsvc::rpc::{router, ReqwestForwarder, ReqwestPeerClient};
use chatsvc::replicator::Replicator;
use chatsvc::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    telemetry::init();

    let self_id = NodeId(
        config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| config.bind_addr.clone()),
    );
    tracing::info!(node = %self_id, "starting chatsvc");

    let hashring = Arc::new(Hashring::new(config.hashring_positions_per_node));

    // No real membership service ships with this crate (see SPEC_FULL.md
    // §6): a single-node static view is the out-of-the-box default. Wire a
    // `FakeMembership`/real watcher here to run a multi-node cluster.
    let membership: Arc<dyn MembershipWatcher> = Arc::new(StaticMembership::new(vec![self_id.clone()]));
    hashring.set_nodes(&membership.current());

    let chats = Arc::new(ChatManager::with_max_participants(
        3600 * 8, // generous default max chat duration; not separately configured
        config.expiration_grace_secs,
        config.chat_max_participants,
    ));

    let http_client = reqwest::Client::new();
    let replicator = Arc::new(Replicator::spawn(
        Arc::new(ReqwestPeerClient::new(http_client.clone())),
        config.replication_pool_size,
        config.replication_max_conns_per_peer,
        config.queue_capacity,
    ));
    let forwarder = Arc::new(ReqwestForwarder::new(http_client));

    let sink = Arc::new(RecordingArchiveSink::default());
    let persister = Arc::new(Persister::spawn(sink, config.persist_pool_size, config.queue_capacity));

    let policy = ReplicationPolicy {
        n: config.replication_n,
        w: config.replication_w,
        max_errors: config.replication_max_errors,
        timeout: config.replication_timeout(),
    };

    // The replicator also watches the hashring directly so messages that
    // only ever reached this node survive an ownership handoff (see
    // spec.md §4.5's ring-change catch-up rule).
    replicator.clone().spawn_ring_catchup(
        hashring.clone(),
        chats.clone(),
        self_id.clone(),
        policy.n,
        policy.max_errors,
        policy.timeout,
    );

    let dispatcher = Arc::new(Dispatcher::with_dedup_by_host(
        self_id.clone(),
        hashring.clone(),
        chats.clone(),
        default_registry(),
        chatsvc::dispatcher::CallbackRegistry::new(),
        replicator,
        persister.clone(),
        forwarder,
        policy,
        config.idle_threshold_secs,
        config.long_poll_wait(),
        !config.replication_allow_same_host,
    ));

    // Keeps the hashring's membership view current as the membership
    // service reports node joins/leaves. A no-op loop for the static
    // membership default (it never changes), but a real watcher's changes
    // flow through the same path.
    let _membership_watcher = {
        let hashring = hashring.clone();
        let membership = membership.clone();
        let mut changes = membership.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                hashring.set_nodes(&membership.current());
            }
        })
    };

    let (gc_shutdown_tx, gc_shutdown_rx) = tokio::sync::watch::channel(());
    let gc = GarbageCollector::new(
        chats.clone(),
        hashring.clone(),
        self_id,
        persister,
        Arc::new(LoggingZombieObserver),
        config.gc_interval(),
        config.gc_throttle(),
    );
    let gc_handle = tokio::spawn(gc.run(gc_shutdown_rx));

    let idle_poller = {
        let dispatcher = dispatcher.clone();
        let idle_interval = config.gc_interval();
        let mut shutdown = gc_shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => dispatcher.poll_idle_users().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown.clone())
        .await?;

    tracing::info!("shutting down");
    // Shutdown order per spec.md §5: hashring membership has already
    // stopped advertising (no more inbound connections past this point);
    // stop the GC and idle poller, then pulse every chat's message signal
    // so long-polls blocked in GetMessages return instead of riding out
    // their full timeout.
    let _ = gc_shutdown_tx.send(());
    let _ = tokio::try_join!(gc_handle, idle_poller);
    chats.trigger_all();

    Ok(())
}
