//! Operations command centre kernel.
//!
//! Collects per-hospital metric payloads on a fixed cycle, rolls them up,
//! raises and tracks threshold alerts, ranks hospitals, and streams each
//! cycle to dashboard subscribers.

pub mod aggregator;
pub mod alerts;
pub mod collector;
pub mod config;
pub mod health;
pub mod history;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod pipeline;
pub mod publisher;
pub mod scoring;
pub mod sources;
pub mod state;
