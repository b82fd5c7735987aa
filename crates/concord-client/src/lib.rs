//! The public surface of Concord (C5 ClusterClient, C6 TTLReaper, C7
//! MembershipController): the only components external collaborators
//! talk to directly.

mod client;
mod membership;
mod ttl_reaper;

pub use client::{ClusterClient, ClusterInfo, ConditionalOptions, PutManyEntry, PutOptions, RequestOptions, Status};
pub use membership::MembershipController;
pub use ttl_reaper::TtlReaper;
