//! `FleetLock` HTTP server.
//!
//! Wires `fleetlock-core`'s components to a running Axum server: the
//! kiosk-facing and staff-facing JSON API under `/v1/*`, a Server-Sent
//! Events stream of locker deltas, and the background reconciliation
//! workers (reservation cleanup, heartbeat cleanup, command GC,
//! rate-limiter GC, event retention) that keep the fleet's logical state
//! converging without an operator watching it.

pub mod background;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
