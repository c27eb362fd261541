pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod job;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod session;
pub mod shutdown;

pub use error::{GantryError, Result};
