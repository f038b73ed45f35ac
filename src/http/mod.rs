//! HTTP/1.x connection engine.
//!
//! This module turns an accepted socket into a sequence of request and
//! response exchanges, with pipelining, `100-continue`, chunked transfer
//! and keep-alive.
//!
//! # Architecture
//!
//! - **`connection`**: the per-connection reader loop, which parses requests
//!   and starts an application thread for each one
//! - **`writer`**: the per-connection writer thread, sending queued
//!   responses in request order
//! - **`request`**: the incoming message state machine and the context
//!   handed to applications
//! - **`response`**: the outgoing message, its framing and status codes
//! - **`message`**: versions, headers and receive modes shared by both
//! - **`parser`**: request line, header block and chunk size parsing
//! - **`socket`**: the transport seam and bounded socket reads and writes
//!
//! # Threads of one connection
//!
//! ```text
//!            socket (read half)                 socket (write half)
//!                   │                                   ▲
//!                   ▼                                   │
//!        ┌─────────────────────┐   response queue  ┌────┴───────────────┐
//!        │ Connection (reader) │ ────────────────▶ │ ResponseWriter     │
//!        └─────────┬───────────┘    (FIFO, None    └────▲───────────────┘
//!                  │ recv_pipe       ends it)           │ send_pipe
//!                  ▼                                    │
//!        ┌─────────────────────────────────────────────┴┐
//!        │ application thread (one per request)         │
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! The reader may already be parsing request N+1 while the writer is still
//! sending response N; responses always leave in the order requests came in.

pub mod connection;
pub mod message;
pub mod parser;
pub mod request;
pub mod response;
pub mod socket;
pub mod writer;
