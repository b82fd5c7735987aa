use std::collections::HashMap;

use raft::eraftpb::Message;
use tokio::sync::mpsc::UnboundedSender;

/// Peer transport boundary (spec.md §6): a reliable, authenticated
/// channel between replicas. Concrete transports (TCP, gRPC, an
/// in-process test harness) are external collaborators; `concord-raft`
/// only depends on this trait plus the `raft` crate's own protobuf wire
/// format, which it never reinterprets.
pub trait Transport: Send + Sync {
    fn send(&self, to: u64, message: Message);
}

/// An in-process transport used by tests and the single-process demo:
/// messages are handed directly to the target node's inbound channel,
/// the same one `RaftNode::spawn_tick_loop` drains.
#[derive(Clone)]
pub struct ChannelTransport {
    peers: HashMap<u64, UnboundedSender<Message>>,
}

impl ChannelTransport {
    pub fn new(peers: HashMap<u64, UnboundedSender<Message>>) -> Self {
        ChannelTransport { peers }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: u64, message: Message) {
        if let Some(sender) = self.peers.get(&to) {
            let _ = sender.send(message);
        }
    }
}
