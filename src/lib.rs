//! Momentum trading orchestration engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod notify;
pub mod sentiment;
pub mod storage;
pub mod strategy;
pub mod types;
pub mod venue;
