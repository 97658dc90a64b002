//! Domain layer - cluster entities, identities and ports

pub mod identifiers;
pub mod objects;
pub mod ports;

pub use identifiers::*;
pub use objects::*;
pub use ports::*;
