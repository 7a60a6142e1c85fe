//! Core domain logic for `FleetLock`.
//!
//! Contains the locker state machine, persistent command queue, heartbeat
//! manager, zone extension engine, multi-dimensional rate limiter, event
//! log, and notification broadcaster. This crate depends on
//! `fleetlock-storage` for the persistence traits and knows nothing about
//! HTTP, env vars, or process lifecycle — that's `fleetlock-server`.

pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod locker;
pub mod notify;
pub mod queue;
pub mod ratelimit;
pub mod zones;
