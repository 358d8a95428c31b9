//! upcheck - HTTP uptime and latency monitor.
//!
//! Probes configured endpoints on a fixed cadence, persists every outcome to
//! SQLite and serves an aggregated status dashboard.

pub mod cache;
pub mod config;
pub mod db;
pub mod probe;
pub mod scheduler;
pub mod web;
