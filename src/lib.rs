//! agent-cache - node-local agent binary cache
//!
//! Keeps one content-addressed copy of each agent version on a node,
//! tracks which tenants and volumes use it, and removes what is left over.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod correctness;
pub mod error;
pub mod events;
pub mod gc;
pub mod installer;
pub mod metadata;
pub mod paths;
pub mod provisioner;
pub mod publisher;
pub mod ui;
pub mod version;

pub use error::{AgentCacheError, AgentCacheResult};
