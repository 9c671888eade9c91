#![deny(unreachable_pub)]
pub mod config;
pub mod gateway;
pub mod grid;
pub mod indicators;
pub mod notify;
pub mod profit_log;
pub mod quantize;
mod errors;
pub use errors::{GridError, GridResult};
