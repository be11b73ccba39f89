pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod format;
pub mod messages;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
