//! Discoproxy - a reverse proxy whose backends come from service discovery
//!
//! This library provides a path-routed reverse proxy that:
//! - Forwards HTTP requests and relays WebSocket connections to backend groups
//! - Picks a backend per request with round-robin load balancing
//! - Keeps backend lists current by watching a registry per project
//! - Fans one registry watch out to every proxy sharing a project
//! - Retries failed watches with exponential backoff
//! - Uses connection pooling for efficient backend communication

pub mod admin;
pub mod backoff;
pub mod config;
pub mod context;
pub mod discover;
pub mod endpoint;
pub mod error;
pub mod http_proxy;
pub mod loadbalancer;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod websocket_proxy;
