pub mod core;
pub mod listener;
