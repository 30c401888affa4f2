//! Event dispatch for the drive controller: a list-watch listener feeding a
//! per-drive serialized worker pool.

pub mod listener;
pub mod queue;

pub use listener::{Listener, ListenerConfig};
pub use queue::{WorkItem, WorkQueue};
