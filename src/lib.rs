#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod proxy;

pub use client::McpClient;
pub use errors::{AppError, Result};
