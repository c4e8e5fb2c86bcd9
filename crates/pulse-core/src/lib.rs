//! pulse-core — wire format, server model, and configuration.
//! All other pulse crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod wire;

pub use endpoint::{QosServer, ServerList};
pub use wire::FlowControl;
