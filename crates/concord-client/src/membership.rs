use std::sync::Arc;
use std::time::Duration;

use concord_base::Result;
use concord_raft::RaftNode;

/// Cluster formation and voter membership changes (C7). The boundary a
/// gossip layer or operator tool drives; discovery of *which* nodes
/// should join is an external collaborator's concern, per spec.md §4.7.
pub struct MembershipController {
    node: Arc<RaftNode>,
}

impl MembershipController {
    pub fn new(node: Arc<RaftNode>) -> Self {
        MembershipController { node }
    }

    /// On first start with no persisted Raft state, the replica already
    /// bootstraps its own initial voter set from `RaftNodeConfig` when
    /// `RaftStorage::open` is called; this just confirms the caller's
    /// expectation about cluster membership, useful once peers have
    /// dialed in and a leader has been elected.
    pub async fn bootstrap(&self, expected_members: &[u64], timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let (members, _) = self.node.members().await;
            if expected_members.iter().all(|id| members.contains(id)) {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(concord_base::Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn add_voter(&self, node_id: u64, timeout: Duration) -> Result<()> {
        self.node.add_voter(node_id, timeout).await
    }

    pub async fn remove_voter(&self, node_id: u64, timeout: Duration) -> Result<()> {
        self.node.remove_voter(node_id, timeout).await
    }

    pub async fn members(&self) -> (Vec<u64>, Option<u64>) {
        self.node.members().await
    }
}
