//! Per-connection session lifecycle.
//!
//! ```text
//! Connecting ──sync()──► Syncing ──state sent──► Active ──close()──► Closed
//!                           │                                           ▲
//!                           └────────────── any failure ────────────────┘
//! ```
//!
//! A session owns no socket. Outbound frames go through the registry to the
//! connection's channel, so the same state machine drives both the real
//! WebSocket handler and the unit tests below.

use std::sync::Arc;

use crate::action::{ActionDispatcher, ActionKind, DispatchError};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::{ClientId, ConnectionRegistry, Outbound, RegistryError};
use crate::storage::{StoreError, WorkspaceStore};

/// Shared services every session talks to.
pub struct SyncContext {
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: ActionDispatcher,
}

impl SyncContext {
    pub fn new(store: Arc<WorkspaceStore>) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            dispatcher: ActionDispatcher::new(store),
        }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        self.dispatcher.store()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Syncing,
    Active,
    Closed,
}

/// What happened to one inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not a valid envelope; ignored
    Dropped,
    /// Unrecognized action type; sender got an error
    UnknownAction,
    /// Validation or storage failure; sender got an error
    Rejected,
    /// Persisted, acked and relayed to `relayed` other connections
    Applied { relayed: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

pub struct Session {
    ctx: Arc<SyncContext>,
    workspace_id: String,
    client_id: Option<ClientId>,
    state: SessionState,
}

impl Session {
    pub fn new(ctx: Arc<SyncContext>, workspace_id: impl Into<String>) -> Self {
        Self {
            ctx,
            workspace_id: workspace_id.into(),
            client_id: None,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Register, make sure the workspace exists and send it the snapshot.
    ///
    /// On failure the session is closed and unregistered.
    pub async fn sync(&mut self, outbound: Outbound) -> Result<ClientId, SessionError> {
        self.expect_state(SessionState::Connecting)?;
        self.state = SessionState::Syncing;

        let client_id = self.ctx.registry.register(&self.workspace_id, outbound).await;
        self.client_id = Some(client_id);

        match self.send_snapshot(client_id).await {
            Ok(()) => {
                self.state = SessionState::Active;
                log::info!("Client {client_id} joined workspace {}", self.workspace_id);
                Ok(client_id)
            }
            Err(e) => {
                log::error!(
                    "Initial sync for client {client_id} in workspace {} failed: {e}",
                    self.workspace_id
                );
                self.close().await;
                Err(e)
            }
        }
    }

    async fn send_snapshot(&self, client_id: ClientId) -> Result<(), SessionError> {
        let store = self.ctx.store();
        store.ensure_workspace(&self.workspace_id)?;
        let state = store.load_workspace_state(&self.workspace_id)?;
        let msg = ServerMessage::state(&state)?;
        self.ctx
            .registry
            .send_to(&self.workspace_id, client_id, &msg)
            .await?;
        Ok(())
    }

    /// Process one inbound text frame.
    ///
    /// Action-level failures are reported to the sender and never end the
    /// session.
    pub async fn handle_text(&mut self, text: &str) -> Result<FrameOutcome, SessionError> {
        self.expect_state(SessionState::Active)?;
        let Some(client_id) = self.client_id else {
            return Err(SessionError::InvalidState {
                expected: SessionState::Active,
                actual: self.state,
            });
        };

        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame from client {client_id}: {e}");
                return Ok(FrameOutcome::Dropped);
            }
        };

        let Some(kind) = ActionKind::from_tag(&msg.action_type) else {
            let reply = ServerMessage::error(
                format!("Unknown action: {}", msg.action_type),
                msg.request_id.clone(),
            );
            self.reply(client_id, &reply).await;
            return Ok(FrameOutcome::UnknownAction);
        };

        if let Err(e) = self
            .ctx
            .dispatcher
            .dispatch(&self.workspace_id, kind, &msg.payload)
        {
            match &e {
                DispatchError::Validation(_) => {
                    log::warn!("Rejected {kind} from client {client_id}: {e}")
                }
                DispatchError::Store(_) => {
                    log::error!("Action {kind} from client {client_id} failed: {e}")
                }
            }
            self.reply(client_id, &ServerMessage::error(e.to_string(), msg.request_id))
                .await;
            return Ok(FrameOutcome::Rejected);
        }

        self.reply(client_id, &ServerMessage::ack(msg.request_id.clone()))
            .await;

        let relay = ServerMessage::action(kind.as_str(), &msg.payload, client_id, msg.request_id);
        let relayed = self
            .ctx
            .registry
            .broadcast(&self.workspace_id, &relay, Some(client_id))
            .await?;
        Ok(FrameOutcome::Applied { relayed })
    }

    async fn reply(&self, client_id: ClientId, msg: &ServerMessage) {
        if let Err(e) = self
            .ctx
            .registry
            .send_to(&self.workspace_id, client_id, msg)
            .await
        {
            log::warn!("Reply to client {client_id} not delivered: {e}");
        }
    }

    /// Leave the registry. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(client_id) = self.client_id {
            self.ctx
                .registry
                .unregister(&self.workspace_id, client_id)
                .await;
            log::info!("Client {client_id} left workspace {}", self.workspace_id);
        }
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}
