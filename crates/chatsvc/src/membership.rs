//! Membership-service boundary. The real service (ZooKeeper in the original)
//! is an external collaborator per spec.md; this module defines the trait a
//! `Dispatcher` depends on plus a static/in-memory fake used by tests and
//! (optionally) single-node deployments, grounded on the teacher's
//! `dekaf::task_manager` watch-channel broadcast pattern.

use tokio::sync::watch;

use crate::hashring::NodeId;

/// Supplies the current peer set and notifies on change. A real
/// implementation would watch a ZooKeeper/etcd/Consul path; this crate ships
/// only the trait and a fake, per spec.md's "membership service" Non-goal.
pub trait MembershipWatcher: Send + Sync {
    /// Current known peers, including self.
    fn current(&self) -> Vec<NodeId>;

    /// A channel that ticks every time `current()` may have changed.
    fn subscribe(&self) -> watch::Receiver<()>;
}

/// A fixed, never-changing membership view — useful for single-node runs and
/// as the trait's simplest implementation.
pub struct StaticMembership {
    nodes: Vec<NodeId>,
    tx: watch::Sender<()>,
}

impl StaticMembership {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let (tx, _rx) = watch::channel(());
        Self { nodes, tx }
    }
}

impl MembershipWatcher for StaticMembership {
    fn current(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

/// An in-memory, mutable membership view for tests: `set_nodes` changes the
/// reported peer set and ticks subscribers, simulating a real watcher
/// observing a node join/leave.
pub struct FakeMembership {
    nodes: std::sync::Mutex<Vec<NodeId>>,
    tx: watch::Sender<()>,
}

impl FakeMembership {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let (tx, _rx) = watch::channel(());
        Self { nodes: std::sync::Mutex::new(nodes), tx }
    }

    pub fn set_nodes(&self, nodes: Vec<NodeId>) {
        *self.nodes.lock().unwrap() = nodes;
        let _ = self.tx.send(());
    }
}

impl MembershipWatcher for FakeMembership {
    fn current(&self) -> Vec<NodeId> {
        self.nodes.lock().unwrap().clone()
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_membership_reports_updates() {
        let fake = FakeMembership::new(vec![NodeId("a".into())]);
        let mut rx = fake.subscribe();
        assert_eq!(fake.current(), vec![NodeId("a".into())]);
        fake.set_nodes(vec![NodeId("a".into()), NodeId("b".into())]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(fake.current().len(), 2);
    }
}
