//! Lobby Session Controller
//!
//! Backend-agnostic coordination of a local user's lobby session:
//!
//! - Create/join/leave with a strict session state machine
//! - A local lobby cache readable without awaiting the controller
//! - Hot-swapping the lobby backend while requests are in flight
//! - Heartbeat-based failover in both directions (owner and member)
//! - Crash cleanup through a persisted stale-session ledger
//! - Capability-filtered fan-out to registered observers
//!
//! # Architecture
//!
//! A single `SessionController` actor owns all mutable state. Backends
//! implement [`provider::LobbyProvider`] and push events through an
//! [`provider::EventSink`]; callers use a cloneable
//! [`actors::SessionControllerHandle`].
//!
//! # Modules
//!
//! - [`actors`] - Controller actor, state machine, cache, heartbeat
//! - [`provider`] - Backend trait, capability traits, loopback backend
//! - [`observers`] - Observer traits and registry
//! - [`ledger`] - Stale-session ledger backends
//! - [`config`] - Configuration from environment
//! - [`errors`] - Error types
//! - [`models`] - Members, requests, results
//! - [`observability`] - Metrics

pub mod actors;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod observability;
pub mod observers;
pub mod provider;

pub use actors::{LobbyState, SessionControllerBuilder, SessionControllerHandle, SessionSnapshot};
pub use errors::{EnterFailure, LobbyError};
pub use metadata::Metadata;
