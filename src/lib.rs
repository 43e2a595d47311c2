//! Floodgate - Action Rate Limiting
//!
//! This crate limits how often an actor (a user id, an IP address) may
//! perform a named action within a sliding time window. Windows are kept in
//! process memory or, when several service instances must share one quota,
//! in Redis sorted sets.

pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod store;
