//! Extensions (protocols) that act on Peers, including the core protocol.

pub mod core;
pub mod extended;
pub mod metadata;
pub mod pex;

pub use self::core::*;
pub use extended::*;
pub use metadata::*;
pub use pex::*;
