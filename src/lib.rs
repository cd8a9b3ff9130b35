//! Offline caching and background sync agent for the Waypost travel journal.
//!
//! [`agent::Agent`] owns the cache tiers, the request router, the mutation
//! queue and the lifecycle; pages drive it through an [`agent::AgentHandle`]
//! or, with platform state attached, a [`bridge::ClientBridge`].

pub mod agent;
pub mod bridge;
pub mod cache;
pub mod clients;
pub mod config;
pub mod db;
pub mod host;
pub mod http;
pub mod lifecycle;
pub mod messages;
pub mod push;
pub mod queue;
pub mod router;
#[cfg(test)]
mod testing;
