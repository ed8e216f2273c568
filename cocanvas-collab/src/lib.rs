//! # cocanvas-collab — Real-time collaboration layer for CoCanvas
//!
//! Conflict-tolerant multi-user editing of shared compositions over
//! WebSocket, with last-write-wins mutation semantics and presence
//! tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │   Client    │ ◄─────────────────► │   CollabServer   │
//! │ (per tab)   │     JSON frames     │                  │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │
//!                      ┌───────────────────────┼──────────────────┐
//!                      ▼                       ▼                  ▼
//!              ┌───────────────┐      ┌────────────────┐  ┌──────────────┐
//!              │OrderDispatcher│      │PresenceRegistry│  │BroadcastRouter│
//!              │ (mutations)   │      │ (who is live)  │  │ (fan-out)    │
//!              └───────┬───────┘      └────────────────┘  └──────────────┘
//!                      ▼
//!              ┌────────────────┐
//!              │CompositionStore│
//!              │ (cocanvas-core)│
//!              └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`order`] — JSON wire protocol: mutation orders and presence notices
//! - [`dispatch`] — Order validation, stamping and store application
//! - [`presence`] — Per-composition registry of live `(user, session)` pairs
//! - [`broadcast`] — Shared-channel and private-queue fan-out
//! - [`lifecycle`] — Subscribe/unsubscribe/disconnect bookkeeping
//! - [`server`] — WebSocket transport shell
//!
//! Mutations commit before fan-out; delivery is best-effort and a failed
//! recipient never affects the rest.

pub mod broadcast;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod order;
pub mod presence;
pub mod server;

// Re-exports for convenience
pub use broadcast::{parse_destination, topic_key, BroadcastRouter, RouterStats, TOPIC_PREFIX};
pub use dispatch::{
    IdentityResolver, OrderDispatcher, SessionIdentity, StaticIdentityResolver,
};
pub use error::{CollabError, CollabResult};
pub use lifecycle::SubscriptionManager;
pub use order::{
    ConnectedMembersNotice, ConnectedUser, Order, OrderMeta, PresenceNotice,
    PresenceNoticeKind, ServerFrame,
};
pub use presence::{Departure, PresenceEntry, PresenceRegistry};
pub use server::{ClientFrame, CollabServer, ServerConfig, ServerStats};
