pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod task;
