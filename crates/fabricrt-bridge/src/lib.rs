//! HTTP → Messaging Bridge (HMB): turns an HTTP request into a correlated
//! conversation over the messaging fabric and turns the reply back into an
//! HTTP response (spec.md §4.4).

pub mod backend;
pub mod envelope;
pub mod error;
pub mod format;
pub mod registry;
pub mod server;
pub mod token;

pub use backend::MessagingBackend;
pub use error::BridgeError;
pub use server::{BridgeConfig, HttpBridge};
