//! Topic schema and wire payloads shared by every device role

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
