//! Reference HTTP artifact cache server.
//!
//! Exposes any cachebox storage backend over `PUT`, `GET` and `HEAD`
//! `/v1/artifacts/{key}`, the protocol spoken by the HTTP storage provider.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{create_router, AppState, ServerError};
