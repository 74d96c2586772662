//! D-PlaneOS control-plane daemon.
//!
//! Wires the persistence (`dplaneos-store`) and domain (`dplaneos-core`)
//! crates into a running Axum server: session-authenticated JSON API under
//! `/api/*`, a WebSocket event feed, and the background monitors that keep
//! the control plane's view of the system current.

pub mod bootgate;
pub mod config;
pub mod error;
pub mod events;
pub mod hardening;
pub mod middleware;
pub mod monitors;
pub mod routes;
pub mod state;
