pub mod app;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod pool;
pub mod provision;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod shutdown;
pub mod version;

pub use error::{Error, Result};
