//! Consistent hashring over peer nodes. Each node claims
//! `positions_per_node` virtual points on a 128-bit ring (MD5 of
//! `"{node_id}:{position}"`); a chat token's owner is the node whose point is
//! the first at or after the token's own hash, walking clockwise. The ring is
//! copy-on-write: readers hold an `Arc<RingSnapshot>` and never block a
//! membership update, matching the original `hashring.py`'s "readers see a
//! consistent point-in-time view" contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

/// A peer node participating in the ring.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub String);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    /// The host portion of a `host:port`-shaped id, used by
    /// `preference_list`'s `dedup_by_host` to treat two peers on the same
    /// machine as one for replication-placement purposes. Ids that carry no
    /// colon (e.g. bare test names like `"a"`) are their own host.
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map(|(host, _port)| host).unwrap_or(&self.0)
    }
}

fn md5_u128(input: &str) -> u128 {
    let digest = md5::compute(input.as_bytes());
    u128::from_be_bytes(*digest)
}

/// The `GetHashring`/`GetPreferenceList` wire form from spec.md §6: a ring
/// position plus the addressing info for the node that claims it. `NodeId`
/// carries only a bare `host:port`, so `service_name`/`hostname`/`fqdn` all
/// derive from the host portion — this crate has no separate service
/// directory to draw a richer name from.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HashringNode {
    pub service_name: String,
    pub service_address: String,
    pub port: u16,
    /// 32-char lowercase hex, per spec.md §6.
    pub token: String,
    pub hostname: String,
    pub fqdn: String,
}

fn hashring_node(node: &NodeId, token: u128) -> HashringNode {
    let port = node.0.rsplit_once(':').and_then(|(_, port)| port.parse().ok()).unwrap_or(0);
    let host = node.host().to_string();
    HashringNode {
        service_name: host.clone(),
        service_address: node.0.clone(),
        port,
        token: format!("{token:032x}"),
        hostname: host.clone(),
        fqdn: host,
    }
}

/// An immutable point-in-time view of the ring. Cheap to clone (it's an
/// `Arc` internally via `Hashring::current`), cheap to hold across an
/// `.await` since it never changes underneath a reader.
#[derive(Clone, Debug, Default)]
pub struct RingSnapshot {
    /// Sorted by ring position. `BTreeMap` gives us the "first position >=
    /// token hash, wrapping" walk via `range` + fallback to the first entry.
    points: BTreeMap<u128, NodeId>,
}

impl RingSnapshot {
    pub fn from_nodes(nodes: &[NodeId], positions_per_node: usize) -> Self {
        let mut points = BTreeMap::new();
        for node in nodes {
            for position in 0..positions_per_node {
                let token = md5_u128(&format!("{}:{}", node.0, position));
                points.insert(token, node.clone());
            }
        }
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Unique node ids present on the ring, in ring order of first
    /// appearance (stable enough for preference-list purposes).
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for node in self.points.values() {
            if !seen.contains(node) {
                seen.push(node.clone());
            }
        }
        seen
    }

    /// `GetHashring()` wire body per spec.md §6: every claimed position,
    /// ordered by ring token. `BTreeMap` iteration is already in ascending
    /// key order, which for 128-bit keys is the same order as lexicographic
    /// hex — so no extra sort is needed.
    pub fn hashring_nodes(&self) -> Vec<HashringNode> {
        self.points.iter().map(|(token, node)| hashring_node(node, *token)).collect()
    }

    /// `GetPreferenceList(chatToken)` wire body: like `preference_list_with`,
    /// but each entry carries the specific ring token that matched during
    /// the clockwise walk (the position at which that node was first
    /// encountered), not just the bare node id.
    pub fn preference_list_nodes_with(&self, token: &str, dedup_by_host: bool) -> Vec<HashringNode> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let hash = md5_u128(token);
        let mut ordered = Vec::with_capacity(self.points.len());
        ordered.extend(self.points.range(hash..));
        ordered.extend(self.points.range(..hash));

        let mut prefs = Vec::new();
        let mut seen_nodes = std::collections::HashSet::new();
        let mut seen_hosts = std::collections::HashSet::new();
        for (point, node) in ordered {
            if !seen_nodes.insert(node.clone()) {
                continue;
            }
            if dedup_by_host && !seen_hosts.insert(node.host().to_string()) {
                continue;
            }
            prefs.push(hashring_node(node, *point));
        }
        prefs
    }

    /// Preference list for `token`: the distinct nodes encountered walking
    /// clockwise from `token`'s hash, wrapping once. `preference_list[0]` is
    /// the primary/owner. Equivalent to `preference_list_with(token, false)`.
    pub fn preference_list(&self, token: &str) -> Vec<NodeId> {
        self.preference_list_with(token, false)
    }

    /// `preferenceList(token, dedupByHost)` per spec.md §4.1: same clockwise
    /// walk as `preference_list`, but when `dedup_by_host` is set, a second
    /// peer position whose `NodeId::host()` matches one already emitted is
    /// skipped too, not just a repeated `serviceKey`. Wired from
    /// `REPLICATION_ALLOW_SAME_HOST`: `allow_same_host = false` (the
    /// default) means replication should not double up on one host, i.e.
    /// `dedup_by_host = true`.
    pub fn preference_list_with(&self, token: &str, dedup_by_host: bool) -> Vec<NodeId> {
        if self.points.is_empty() {
            return Vec::new();
        }
        let hash = md5_u128(token);
        let mut ordered = Vec::with_capacity(self.points.len());
        ordered.extend(self.points.range(hash..).map(|(_, n)| n.clone()));
        ordered.extend(self.points.range(..hash).map(|(_, n)| n.clone()));

        let mut prefs = Vec::new();
        let mut seen_hosts = std::collections::HashSet::new();
        for node in ordered {
            if prefs.contains(&node) {
                continue;
            }
            if dedup_by_host && !seen_hosts.insert(node.host().to_string()) {
                continue;
            }
            prefs.push(node);
        }
        prefs
    }

    pub fn owner(&self, token: &str) -> Option<NodeId> {
        self.preference_list(token).into_iter().next()
    }
}

/// Owns the live ring and notifies subscribers of membership changes via a
/// `watch` channel carrying the new snapshot, matching the
/// `subscribe(observer)` contract in spec.md §4.1 and the broadcast style
/// used in `dekaf::task_manager`.
pub struct Hashring {
    positions_per_node: usize,
    tx: watch::Sender<Arc<RingSnapshot>>,
}

impl Hashring {
    pub fn new(positions_per_node: usize) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(RingSnapshot::default()));
        Self { tx, positions_per_node }
    }

    pub fn current(&self) -> Arc<RingSnapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to future ring changes. The returned receiver's initial
    /// `borrow()` is the current snapshot at subscribe time.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RingSnapshot>> {
        self.tx.subscribe()
    }

    /// Replace the membership set, rebuilding the ring and notifying
    /// subscribers. A no-op (no notification) if the resulting ring is
    /// identical to the current one.
    pub fn set_nodes(&self, nodes: &[NodeId]) {
        let next = RingSnapshot::from_nodes(nodes, self.positions_per_node);
        let changed = {
            let current = self.tx.borrow();
            current.points != next.points
        };
        if changed {
            let _ = self.tx.send(Arc::new(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId(n.to_string())).collect()
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = RingSnapshot::default();
        assert_eq!(ring.owner("chat-1"), None);
    }

    #[test]
    fn preference_list_contains_every_node_once() {
        use pretty_assertions::assert_eq;

        let snap = RingSnapshot::from_nodes(&nodes(&["a", "b", "c"]), 3);
        let mut prefs: Vec<_> = snap.preference_list("chat-42").into_iter().map(|n| n.0).collect();
        prefs.sort();
        assert_eq!(prefs, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn same_token_same_owner_is_stable() {
        let snap = RingSnapshot::from_nodes(&nodes(&["a", "b", "c", "d"]), 3);
        let owner1 = snap.owner("chat-99");
        let owner2 = snap.owner("chat-99");
        assert_eq!(owner1, owner2);
    }

    #[test]
    fn dedup_by_host_collapses_peers_on_the_same_machine() {
        let snap = RingSnapshot::from_nodes(
            &[NodeId("10.0.0.1:7070".into()), NodeId("10.0.0.1:7071".into()), NodeId("10.0.0.2:7070".into())],
            3,
        );
        let prefs = snap.preference_list_with("chat-1", true);
        let hosts: Vec<&str> = prefs.iter().map(|n| n.host()).collect();
        let mut unique_hosts = hosts.clone();
        unique_hosts.sort();
        unique_hosts.dedup();
        assert_eq!(hosts.len(), unique_hosts.len(), "no host should appear twice when dedup_by_host is set");

        let without_dedup = snap.preference_list_with("chat-1", false);
        assert_eq!(without_dedup.len(), 3, "without dedup_by_host, every node is its own entry");
    }

    #[test]
    fn hashring_nodes_are_ordered_by_token_and_cover_every_position() {
        let snap = RingSnapshot::from_nodes(&nodes(&["a", "b", "c"]), 4);
        let wire = snap.hashring_nodes();
        assert_eq!(wire.len(), 12, "3 nodes * 4 positions each");

        let tokens: Vec<&str> = wire.iter().map(|n| n.token.as_str()).collect();
        let mut sorted = tokens.clone();
        sorted.sort();
        assert_eq!(tokens, sorted, "GetHashring must be ordered by ring token");
        for token in &tokens {
            assert_eq!(token.len(), 32);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn preference_list_nodes_carries_the_matched_token() {
        let snap = RingSnapshot::from_nodes(&nodes(&["a", "b", "c"]), 3);
        let plain = snap.preference_list("chat-42");
        let wired = snap.preference_list_nodes_with("chat-42", false);
        assert_eq!(wired.len(), plain.len());
        for (node, wire) in plain.iter().zip(wired.iter()) {
            assert_eq!(node.0, wire.service_address);
        }
    }

    #[test]
    fn set_nodes_notifies_subscribers_on_change() {
        let ring = Hashring::new(3);
        let mut rx = ring.subscribe();
        ring.set_nodes(&nodes(&["a"]));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        ring.set_nodes(&nodes(&["a"]));
        assert!(!rx.has_changed().unwrap());
    }
}
