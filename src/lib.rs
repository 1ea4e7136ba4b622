// Core modules
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod models;
pub mod pnl;
pub mod ratelimit;
pub mod retry;

// Re-export commonly used types
pub use error::AdapterError;
pub use models::*;
