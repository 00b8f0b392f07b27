//! The Piko server node.
//!
//! Assembles the routing fabric into a runnable process: the proxy
//! listener clients hit, the upstream listener agents dial into, the admin
//! API, and the gossip broadcaster that keeps peers' cluster views
//! converging.

pub mod admin;
pub mod cli;
pub mod config;
pub mod gossip;
pub mod server;

pub use config::Config;
pub use server::Server;
