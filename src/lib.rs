pub mod config;
pub mod error;
pub mod logging;
pub mod purge;
pub mod record;
pub mod server;
pub mod store;
