//! # referencer-sync — Real-time sync engine for shared annotation workspaces
//!
//! Clients open one WebSocket per workspace, receive the full workspace state,
//! then send actions (layer, annotation and editor pane edits). Each action is
//! validated, persisted, acknowledged to its sender and relayed to every other
//! client in the same workspace.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames    ┌─────────────┐
//! │ Client      │ ◄──────────────► │ Session     │──┐
//! │ (per user)  │   /ws/<id>       │ (per conn)  │  │ relay
//! └─────────────┘                  └──────┬──────┘  ▼
//!                                         │   ┌────────────────────┐
//!                                         │   │ ConnectionRegistry │
//!                                         ▼   └────────────────────┘
//!                                  ┌─────────────┐
//!                                  │ Dispatcher  │
//!                                  └──────┬──────┘
//!                                         ▼
//!                                  ┌────────────────┐
//!                                  │ WorkspaceStore │
//!                                  │ (RocksDB)      │
//!                                  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelopes
//! - [`registry`] — per-workspace connection registry with fan-out
//! - [`action`] — payload validation and dispatch to the store
//! - [`session`] — connect → sync → active → closed state machine
//! - [`server`] — WebSocket listener
//! - [`storage`] — RocksDB persistence

pub mod action;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use action::{Action, ActionDispatcher, ActionKind, DispatchError, ValidationError};
pub use protocol::{ClientMessage, Payload, ProtocolError, ServerMessage, ServerMessageType};
pub use registry::{
    ClientId, ConnectionRegistry, Outbound, RegistryError, RegistryStats, DEFAULT_OUTBOUND_CAPACITY,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{FrameOutcome, Session, SessionError, SessionState, SyncContext};
pub use storage::{StoreConfig, StoreError, WorkspaceState, WorkspaceStore};
