//! Live-location handshake between a passenger and a vehicle operator
//!
//! - [`session`]: pure per-session state machine
//! - [`owner`]: passenger-side owner that runs session effects
//! - [`operator`]: operator-side request board

pub mod operator;
pub mod owner;
pub mod session;

pub use operator::{OperatorDesk, RequestBoard, RequestItem, RequestStatus};
pub use owner::{HandshakeTick, LiveLocationHandshake, SessionKey, TickKind};
pub use session::{
    EndReason, HandshakeSettings, LiveLocationSession, SessionEffect, SessionStatus,
};
