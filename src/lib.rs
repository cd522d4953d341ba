pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod middleware;
pub mod plugin;
pub mod protocol;
pub mod provider;
pub mod resilience;
pub mod server;
pub mod tools;
pub mod transport;

pub use error::{Result, RuntimeError};
pub use server::{Server, ServerBuilder};
