//! plume server library crate.
//!
//! Exposes the server core and its subsystems for the `plumed` binary and
//! the integration tests: configuration, accounts, client and route
//! connection handling, and the cluster manager.
pub mod account;
pub mod client;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod route;
pub mod server;

pub use config::ServerConfig;
pub use server::Server;
