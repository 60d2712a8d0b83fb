//! Testing utilities and mock implementations
//!
//! Mocks for the transport, notifier and backend seams, so the core can be
//! exercised without a broker or an HTTP backend.

pub mod mocks;

pub use mocks::*;
