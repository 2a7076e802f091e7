//! Call Controller (CC) Service Library
//!
//! The coordination core for one-to-one and group audio/video calls:
//!
//! - Call and participant lifecycle with a closed state machine
//! - Durable call records and an append-only audit log (Postgres)
//! - Process-local presence (Session Cache) with a bounded signaling replay queue
//! - WebRTC signaling relay between members of the same call
//! - Background sweeping of stale calls and overdue invitations
//! - A WebSocket gateway speaking JSON frames
//!
//! # Architecture
//!
//! ```text
//! WebSocket gateway (one task per socket)
//! └── CallControllerHandle (routing, no global lock)
//!     ├── CallActor (one per call with traffic, serializes its mutations)
//!     │   └── LifecycleEngine ──► CallRegistry (Postgres | memory)
//!     │                       └─► SessionCache
//!     └── SignalingRelay ──► SessionCache, GatewayHub (fan-out)
//! Sweeper task ──► CallControllerHandle
//! ```
//!
//! The registry is the only source of truth. The Session Cache is derived
//! from it one way and is rebuilt by rejoining users after a restart.
//!
//! # Modules
//!
//! - [`actors`] - per-call actors and the routing handle
//! - [`lifecycle`] - the call state machine driver
//! - [`repositories`] - the Call Registry
//! - [`session`] - the Session Cache
//! - [`signaling`] - the Signaling Relay
//! - [`tasks`] - the Presence/Cleanup Sweeper
//! - [`gateway`] - the WebSocket Transport Gateway
//! - [`config`] - service configuration from environment
//! - [`errors`] - error type with client-facing kinds

pub mod actors;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod notifications;
pub mod observability;
pub mod repositories;
pub mod session;
pub mod signaling;
pub mod tasks;
