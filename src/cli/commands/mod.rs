//! CLI command implementations

pub mod config;
pub mod store;

pub use config::execute as config;
pub use store::execute as store;
