//! Inbound message routing
//!
//! [`TopicRouter`] maps a topic string and raw payload onto a typed
//! [`RoutedMessage`] for one vehicle. Dispatching the result to the fleet,
//! handshake and trip components is the pipeline's job.

pub mod router;

pub use router::{RoutedMessage, TopicRouter};
