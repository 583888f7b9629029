pub mod clock;
pub mod digest;

pub use clock::*;
pub use digest::*;

/// Identifier of a replica, as listed in the server table.
pub type ServerId = u32;
