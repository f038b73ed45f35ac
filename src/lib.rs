//! Tandem - a threaded HTTP/1.1 server engine
//!
//! Core library: synchronisation primitives, the per-connection
//! request/response engine, and the server that admits and routes
//! connections.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
pub mod sync;
