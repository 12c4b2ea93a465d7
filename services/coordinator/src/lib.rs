//! Partition coordinator service.
//!
//! # Purpose
//! Exposes the assignment operations over HTTP for the bridge and authority
//! fleets: claim the lowest free partition of a topic, release it on
//! shutdown. In clustered mode the assignment store lives in the shared
//! coordination store and one leader-elected instance sweeps assignments
//! whose owners the registry stopped reporting.
pub mod api;
pub mod config;
