//! Admission, supervision and rating of Disk Tunnel benchmark runs.
//!
//! The [orchestrator::Orchestrator] owns the run registry and its durable mirror, and hands
//! admitted runs to the runner. [api::router] exposes it over HTTP.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod shutdown;
pub mod state_store;
