//! The deterministic replicated state machine (C3): the command
//! alphabet, the `(state, command) -> (state', reply)` transition
//! function, the (unlogged) query handlers, and snapshot save/restore.

mod command;
mod machine;

pub use command::{Command, CommandReply, KeyOutcome, PutEntry, StoreSnapshot, TouchEntry, SNAPSHOT_SCHEMA_VERSION};
pub use machine::StateMachine;
