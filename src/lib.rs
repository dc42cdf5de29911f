//! dcabot backend library.
//!
//! Exposes the engine, store, and HTTP surfaces for the `dcabot` binary and
//! the integration tests.

pub mod api;
pub mod auth;
pub mod cache;
pub mod engine;
pub mod exchange;
pub mod grid;
pub mod middleware;
pub mod models;
pub mod precision;
pub mod state;
pub mod store;
