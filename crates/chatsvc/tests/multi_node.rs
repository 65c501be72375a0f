//! Multi-node end-to-end scenarios. Each test spins up one or more
//! in-process `Dispatcher`s behind real `axum` servers on loopback ports and
//! (for replication) talks to peers over real `reqwest` connections — the
//! only way to meaningfully exercise ownership routing and quorum
//! replication across node boundaries.

use std::sync::Arc;
use std::time::Duration;

use chatsvc::chat::{ChatManager, MessageDraft};
use chatsvc::dispatcher::{CallbackRegistry, Dispatcher, ReplicationPolicy};
use chatsvc::gc::GarbageCollector;
use chatsvc::hashring::{Hashring, NodeId};
use chatsvc::message::{ChatStatus, Payload, Route};
use chatsvc::persister::{Persister, RecordingArchiveSink};
use chatsvc::plugin::default_registry;
use chatsvc::replicator::Replicator;
use chatsvc::rpc::{router, ReqwestForwarder, ReqwestPeerClient};

struct Node {
    id: NodeId,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<RecordingArchiveSink>,
}

/// Boots `count` nodes that already agree on the full membership set before
/// any request is served — every scenario here assumes a settled ring.
async fn spawn_cluster(count: usize, policy: ReplicationPolicy) -> Vec<Node> {
    let mut listeners = Vec::new();
    for _ in 0..count {
        listeners.push(tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let ids: Vec<NodeId> = listeners.iter().map(|l| NodeId(l.local_addr().unwrap().to_string())).collect();

    let mut nodes = Vec::new();
    for listener in listeners {
        let id = NodeId(listener.local_addr().unwrap().to_string());
        let hashring = Arc::new(Hashring::new(3));
        hashring.set_nodes(&ids);

        let chats = Arc::new(ChatManager::new(3600, 360));
        let http_client = reqwest::Client::new();
        let replicator = Arc::new(Replicator::new(Arc::new(ReqwestPeerClient::new(http_client.clone())), 1));
        let forwarder = Arc::new(ReqwestForwarder::new(http_client));
        let sink = Arc::new(RecordingArchiveSink::default());
        let persister = Arc::new(Persister::spawn(sink.clone(), 2, 10));

        let dispatcher = Arc::new(Dispatcher::new(
            id.clone(),
            hashring,
            chats,
            default_registry(),
            CallbackRegistry::new(),
            replicator,
            persister,
            forwarder,
            policy.clone(),
            20,
            Duration::from_secs(2),
        ));

        let app = router(dispatcher.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        nodes.push(Node { id, dispatcher, sink });
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    nodes
}

fn status_draft(status: ChatStatus) -> MessageDraft {
    MessageDraft {
        user_id: "alice".into(),
        recipients: None,
        route: Route::Broadcast,
        client_timestamp: None,
        payload: Payload::ChatStatus { status },
    }
}

/// Sends through whichever node in `nodes` happens to own `chat_token`,
/// forwarding transparently through the others — any node can be asked, the
/// dispatcher forwards to the real owner.
async fn send_through_any(nodes: &[Node], chat_token: &str, draft: MessageDraft) -> Vec<chatsvc::message::Message> {
    nodes[0].dispatcher.send_message(chat_token, vec![draft]).await.unwrap()
}

#[tokio::test]
async fn s1_single_node_send_and_receive() {
    let policy = ReplicationPolicy { n: 1, w: 1, max_errors: 2, timeout: Duration::from_secs(1) };
    let nodes = spawn_cluster(1, policy).await;
    let node = &nodes[0];

    let sent = node.dispatcher.send_message("chat-1", vec![status_draft(ChatStatus::Started)]).await.unwrap();
    assert_eq!(sent.len(), 1);

    let fetched = node.dispatcher.get_messages("chat-1", 0, false, Some(Duration::from_secs(1)), None).await.unwrap();
    assert_eq!(fetched.len(), 1);
}

#[tokio::test]
async fn s2_quorum_replication_reaches_peer_via_forwarding() {
    let policy = ReplicationPolicy { n: 2, w: 2, max_errors: 0, timeout: Duration::from_secs(2) };
    let nodes = spawn_cluster(2, policy).await;

    let sent = send_through_any(&nodes, "chat-rep", status_draft(ChatStatus::Started)).await;
    assert_eq!(sent.len(), 1);

    // Either node may be the owner; whichever local `Dispatcher` we ask,
    // forwarding resolves to the real answer and replication to the other
    // peer has already completed by the time send_message returns (W=2).
    let fetched = nodes[1].dispatcher.get_messages("chat-rep", 0, false, Some(Duration::from_secs(1)), None).await.unwrap();
    assert_eq!(fetched.len(), 1);
}

#[tokio::test]
async fn s3_quorum_failure_when_peer_unreachable() {
    // N=2, W=2 but only one node is up: the second preference-list entry is
    // some address nothing is listening on, so quorum can never be reached.
    let policy = ReplicationPolicy { n: 2, w: 2, max_errors: 0, timeout: Duration::from_millis(200) };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let self_addr = listener.local_addr().unwrap();
    let unreachable_addr = "127.0.0.1:1"; // reserved, nothing binds here

    let ids = vec![NodeId(self_addr.to_string()), NodeId(unreachable_addr.to_string())];
    let hashring = Arc::new(Hashring::new(3));
    hashring.set_nodes(&ids);

    let chats = Arc::new(ChatManager::new(3600, 360));
    let http_client = reqwest::Client::new();
    let replicator = Arc::new(Replicator::new(Arc::new(ReqwestPeerClient::new(http_client.clone())), 1));
    let forwarder = Arc::new(ReqwestForwarder::new(http_client));
    let sink = Arc::new(RecordingArchiveSink::default());
    let persister = Arc::new(Persister::spawn(sink, 2, 10));

    let dispatcher = Arc::new(Dispatcher::new(
        NodeId(self_addr.to_string()),
        hashring,
        chats,
        default_registry(),
        CallbackRegistry::new(),
        replicator,
        persister,
        forwarder,
        policy,
        20,
        Duration::from_secs(2),
    ));
    let app = router(dispatcher.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = dispatcher.send_message("chat-unreachable", vec![status_draft(ChatStatus::Started)]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn s4_ownership_handoff_catches_up_the_new_primary() {
    // A holds a message replicated nowhere else (N=1, W=1). The ring is then
    // reconfigured so B becomes primary for that chat; the replicator's
    // ring-change catch-up must ship the message to B without a resend from
    // the client.
    let policy = ReplicationPolicy { n: 1, w: 1, max_errors: 2, timeout: Duration::from_secs(1) };

    let listener_a = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let id_a = NodeId(listener_a.local_addr().unwrap().to_string());
    let id_b = NodeId(listener_b.local_addr().unwrap().to_string());

    // Find a chat token that B will own once both nodes are on the ring —
    // any token works while the ring holds only A.
    let two_node_view = chatsvc::hashring::RingSnapshot::from_nodes(&[id_a.clone(), id_b.clone()], 3);
    let chat_token = (0..10_000)
        .map(|i| format!("handoff-{i}"))
        .find(|token| two_node_view.owner(token) == Some(id_b.clone()))
        .expect("some token must hash to node B out of 10,000 tries");

    let hashring_a = Arc::new(Hashring::new(3));
    hashring_a.set_nodes(&[id_a.clone()]);
    let chats_a = Arc::new(ChatManager::new(3600, 360));
    let http_client = reqwest::Client::new();
    let replicator_a = Arc::new(Replicator::new(Arc::new(ReqwestPeerClient::new(http_client.clone())), 1));
    let forwarder_a = Arc::new(ReqwestForwarder::new(http_client.clone()));
    let sink_a = Arc::new(RecordingArchiveSink::default());
    let persister_a = Arc::new(Persister::spawn(sink_a, 2, 10));
    replicator_a.clone().spawn_ring_catchup(hashring_a.clone(), chats_a.clone(), id_a.clone(), 2, 2, Duration::from_secs(1));
    let dispatcher_a = Arc::new(Dispatcher::new(
        id_a.clone(),
        hashring_a.clone(),
        chats_a.clone(),
        default_registry(),
        CallbackRegistry::new(),
        replicator_a,
        persister_a,
        forwarder_a,
        policy.clone(),
        20,
        Duration::from_secs(2),
    ));
    tokio::spawn({
        let app = router(dispatcher_a.clone());
        async move { axum::serve(listener_a, app).await.unwrap() }
    });

    let hashring_b = Arc::new(Hashring::new(3));
    hashring_b.set_nodes(&[id_a.clone()]);
    let chats_b = Arc::new(ChatManager::new(3600, 360));
    let replicator_b = Arc::new(Replicator::new(Arc::new(ReqwestPeerClient::new(http_client.clone())), 1));
    let forwarder_b = Arc::new(ReqwestForwarder::new(http_client));
    let sink_b = Arc::new(RecordingArchiveSink::default());
    let persister_b = Arc::new(Persister::spawn(sink_b, 2, 10));
    let dispatcher_b = Arc::new(Dispatcher::new(
        id_b.clone(),
        hashring_b.clone(),
        chats_b.clone(),
        default_registry(),
        CallbackRegistry::new(),
        replicator_b,
        persister_b,
        forwarder_b,
        policy,
        20,
        Duration::from_secs(2),
    ));
    tokio::spawn({
        let app = router(dispatcher_b.clone());
        async move { axum::serve(listener_b, app).await.unwrap() }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;

    dispatcher_a.send_message(&chat_token, vec![status_draft(ChatStatus::Started)]).await.unwrap();

    // Ring changes: both nodes now agree B owns this token.
    hashring_a.set_nodes(&[id_a.clone(), id_b.clone()]);
    hashring_b.set_nodes(&[id_a, id_b]);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let fetched = dispatcher_b.get_messages(&chat_token, 0, false, Some(Duration::from_secs(1)), None).await.unwrap();
    assert_eq!(fetched.len(), 1, "new primary should have received the catch-up snapshot");
}

#[tokio::test]
async fn s5_ending_a_chat_triggers_persistence() {
    let policy = ReplicationPolicy { n: 1, w: 1, max_errors: 2, timeout: Duration::from_secs(1) };
    let nodes = spawn_cluster(1, policy).await;
    let node = &nodes[0];

    node.dispatcher.send_message("chat-end", vec![status_draft(ChatStatus::Started)]).await.unwrap();
    node.dispatcher.send_message("chat-end", vec![status_draft(ChatStatus::Ended)]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.sink.jobs().len(), 1);
    assert_eq!(node.sink.jobs()[0].chat_token, "chat-end");
}

#[tokio::test]
async fn get_hashring_and_preference_list_are_served_over_rpc() {
    use pretty_assertions::assert_eq;

    let policy = ReplicationPolicy { n: 1, w: 1, max_errors: 2, timeout: Duration::from_secs(1) };
    let nodes = spawn_cluster(2, policy).await;
    let base = format!("http://{}", nodes[0].id);
    let client = reqwest::Client::new();

    let ring: Vec<chatsvc::hashring::HashringNode> = client
        .post(format!("{base}/rpc/hashring"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // 3 ring positions per node (see `spawn_cluster`'s `Hashring::new(3)`), so
    // a 2-node ring reports 6 entries, not 2 — GetHashring is every claimed
    // position, not deduplicated by node.
    assert_eq!(ring.len(), 6);
    let tokens: Vec<&str> = ring.iter().map(|n| n.token.as_str()).collect();
    let mut sorted_tokens = tokens.clone();
    sorted_tokens.sort();
    assert_eq!(tokens, sorted_tokens, "GetHashring must be ordered by ring token");

    let mut ring_ids: Vec<String> = ring.iter().map(|n| n.service_address.clone()).collect();
    ring_ids.sort();
    ring_ids.dedup();
    let mut expected_ids: Vec<String> = nodes.iter().map(|n| n.id.0.clone()).collect();
    expected_ids.sort();
    assert_eq!(ring_ids, expected_ids);

    let prefs: Vec<chatsvc::hashring::HashringNode> = client
        .post(format!("{base}/rpc/preference_list"))
        .json(&serde_json::json!({ "chat_token": "chat-prefs" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(prefs.len(), 2, "both nodes should appear in the preference list for a 2-node ring");
}

#[tokio::test]
async fn s6_zombie_chat_is_reported_when_unended() {
    // A zero-duration/zero-grace chat is "expired" the instant it starts,
    // without waiting on real wall-clock time.
    let hashring = Arc::new(Hashring::new(3));
    let self_id = NodeId("self".into());
    hashring.set_nodes(&[self_id.clone()]);

    // grace=-1 makes `now() > start - 1` hold immediately, since now() is
    // always >= start — avoids flaking right at a wall-clock second boundary.
    let chats = Arc::new(ChatManager::new(0, -1));
    let chat = chats.get_or_create("chat-zombie");
    chat.append_messages(vec![status_draft(ChatStatus::Started)]);

    struct Recording(std::sync::Mutex<Vec<String>>);
    impl chatsvc::gc::ZombieObserver for Recording {
        fn on_zombie(&self, chat_token: &str) {
            self.0.lock().unwrap().push(chat_token.to_string());
        }
    }
    let observer = Arc::new(Recording(Default::default()));
    let sink = Arc::new(RecordingArchiveSink::default());
    let persister = Arc::new(Persister::spawn(sink.clone(), 1, 10));

    let gc = GarbageCollector::new(
        chats.clone(),
        hashring,
        self_id,
        persister,
        observer.clone(),
        Duration::from_secs(60),
        Duration::from_millis(1),
    );
    gc.sweep_once().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(observer.0.lock().unwrap().as_slice(), &["chat-zombie".to_string()]);
    let chat = chats.get("chat-zombie").expect("zombie chat stays until a later sweep removes it");
    assert!(chat.persisted(), "one GC cycle must persist the zombie chat");
    assert_eq!(sink.jobs().len(), 1, "an archive-job row must exist for the zombie chat");
    assert_eq!(sink.jobs()[0].chat_token, "chat-zombie");
}
