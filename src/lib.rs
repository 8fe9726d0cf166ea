//! Dockgate - subdomain routing for Docker containers
//!
//! This library publishes running containers as `<name>.<root domain>`:
//! - Watches the Docker event feed and keeps a live service registry
//! - Routes HTTP traffic by the first label of the Host header
//! - Relays protocol upgrades (WebSocket) with full-duplex forwarding
//! - Reuses backend connections through a connection pool
//! - Exposes a JSON management API over the registry and the Docker daemon

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod events;
pub mod history;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod watcher;
