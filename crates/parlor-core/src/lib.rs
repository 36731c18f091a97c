//! Deterministic domain logic for the Parlor realtime messaging server.
//!
//! Every module here is a pure state machine: methods take the current time
//! (and, where ids are minted, an [`env::Environment`]) as input and return
//! values or action lists for a driver to execute. No I/O, no clocks, no
//! global state, so every behavior is reproducible in tests with a synthetic
//! environment.
//!
//! # Components
//!
//! - [`connection`]: Per-connection lifecycle state machine (handshake,
//!   heartbeats, timeouts)
//! - [`presence`]: Cross-room online/away/busy/offline aggregation over a
//!   user's live connections
//! - [`room`]: Room definitions, membership rosters, and direct-room id
//!   synthesis
//! - [`sequencer`]: Per-room monotonic sequence assignment
//! - [`typing`]: Ephemeral typing indicators with idle expiry
//! - [`reactions`]: Idempotent per-message emoji toggles with aggregate
//!   counts
//! - [`receipts`]: Append-only read receipts
//! - [`moderation`]: Role-gated restrictions (mute/ban) with point-in-time
//!   expiry and a bounded audit log
//! - [`mentions`]: `@username` extraction against a room roster

pub mod connection;
pub mod env;
pub mod error;
pub mod mentions;
pub mod moderation;
pub mod presence;
pub mod reactions;
pub mod receipts;
pub mod room;
pub mod sequencer;
pub mod typing;

pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::{ConnectionError, RoomError};
pub use room::{RoomId, UserId};
