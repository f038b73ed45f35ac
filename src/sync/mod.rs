//! Thread synchronisation primitives used by the connection engine.
//!
//! - **`event`**: [`SyncEvent`], a settable flag that can cascade into other
//!   flags, and [`wait_any`] for waiting on the first of several flags
//! - **`pipe`**: [`Pipe`], a bounded in-process byte stream connecting the
//!   socket workers with application threads

pub mod event;
pub mod pipe;

pub use event::{SyncEvent, wait_any};
pub use pipe::{DEFAULT_BUFFER_SIZE, Pipe, PipeBuilder};
