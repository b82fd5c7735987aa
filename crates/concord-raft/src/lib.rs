mod config;
mod node;
mod storage;
mod transport;

pub use config::RaftNodeConfig;
pub use node::RaftNode;
pub use storage::RaftStorage;
pub use transport::{ChannelTransport, Transport};

pub use raft::eraftpb::Message;
pub use raft::StateRole;
