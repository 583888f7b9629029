pub mod message;
pub mod peers;
pub mod queue;
pub mod replica;

pub use message::*;
pub use peers::*;
pub use queue::*;
pub use replica::{Replica, ReplicaError};
