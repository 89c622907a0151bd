//! Per-workspace registry of live connections.
//!
//! The registry never touches a socket. Each connection is represented by the
//! sending half of a bounded channel whose receiver is drained by that
//! connection's writer task, so delivery is a non-blocking `try_send`.
//! A connection whose queue is full misses the frame; nobody else waits on it.
//! Broadcast copies the recipient set under the read lock and releases it
//! before pushing anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Registry-issued connection identity.
pub type ClientId = Uuid;

/// Handle used to queue frames for one connection.
pub type Outbound = mpsc::Sender<Message>;

/// Frames buffered per connection before further frames are dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Registry errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("client {client_id} not found in workspace {workspace_id}")]
    NotFound {
        workspace_id: String,
        client_id: ClientId,
    },
    #[error("connection {0} closed")]
    Closed(ClientId),
    #[error("outbound queue of connection {0} is full")]
    Full(ClientId),
    #[error(transparent)]
    Serialization(#[from] ProtocolError),
}

/// Delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub messages_sent: u64,
    /// Frames not queued, for any reason
    pub delivery_failures: u64,
    /// Frames not queued because the recipient's queue was full
    pub messages_dropped: u64,
}

/// Workspace → client id → outbound handle.
pub struct ConnectionRegistry {
    workspaces: RwLock<HashMap<String, HashMap<ClientId, Outbound>>>,
    messages_sent: AtomicU64,
    delivery_failures: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a connection to a workspace, creating the bucket if needed.
    pub async fn register(&self, workspace_id: &str, outbound: Outbound) -> ClientId {
        let client_id = Uuid::new_v4();
        let mut workspaces = self.workspaces.write().await;
        workspaces
            .entry(workspace_id.to_string())
            .or_default()
            .insert(client_id, outbound);
        client_id
    }

    /// Remove a connection. Empty buckets are dropped.
    ///
    /// Returns `false` if the connection was not registered.
    pub async fn unregister(&self, workspace_id: &str, client_id: ClientId) -> bool {
        let mut workspaces = self.workspaces.write().await;
        let Some(clients) = workspaces.get_mut(workspace_id) else {
            return false;
        };
        let removed = clients.remove(&client_id).is_some();
        if clients.is_empty() {
            workspaces.remove(workspace_id);
        }
        removed
    }

    /// Deliver a message to a single connection.
    pub async fn send_to(
        &self,
        workspace_id: &str,
        client_id: ClientId,
        msg: &ServerMessage,
    ) -> Result<(), RegistryError> {
        let outbound = {
            let workspaces = self.workspaces.read().await;
            workspaces
                .get(workspace_id)
                .and_then(|clients| clients.get(&client_id))
                .cloned()
        };
        let outbound = outbound.ok_or_else(|| RegistryError::NotFound {
            workspace_id: workspace_id.to_string(),
            client_id,
        })?;

        let frame = Message::text(msg.encode()?);
        self.push(client_id, &outbound, frame)?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver a message to every connection in the workspace except `exclude`.
    ///
    /// Failed deliveries are logged and skipped. Returns the number of
    /// connections the message was queued for.
    pub async fn broadcast(
        &self,
        workspace_id: &str,
        msg: &ServerMessage,
        exclude: Option<ClientId>,
    ) -> Result<usize, RegistryError> {
        let recipients: Vec<(ClientId, Outbound)> = {
            let workspaces = self.workspaces.read().await;
            match workspaces.get(workspace_id) {
                Some(clients) => clients
                    .iter()
                    .filter(|(id, _)| Some(**id) != exclude)
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        if recipients.is_empty() {
            return Ok(0);
        }

        let frame = Message::text(msg.encode()?);
        let mut delivered = 0;
        for (client_id, outbound) in recipients {
            if let Err(e) = self.push(client_id, &outbound, frame.clone()) {
                log::warn!("Broadcast in workspace {workspace_id} skipped: {e}");
                continue;
            }
            delivered += 1;
        }
        self.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Queue one frame without waiting, counting failures.
    fn push(&self, client_id: ClientId, outbound: &Outbound, frame: Message) -> Result<(), RegistryError> {
        match outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Err(RegistryError::Full(client_id))
            }
            Err(TrySendError::Closed(_)) => {
                self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                Err(RegistryError::Closed(client_id))
            }
        }
    }

    /// Number of live connections in a workspace.
    pub async fn connection_count(&self, workspace_id: &str) -> usize {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map_or(0, HashMap::len)
    }

    /// Number of workspaces with at least one live connection.
    pub async fn workspace_count(&self) -> usize {
        self.workspaces.read().await.len()
    }

    pub async fn is_connected(&self, workspace_id: &str, client_id: ClientId) -> bool {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .is_some_and(|clients| clients.contains_key(&client_id))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessageType;
    use std::sync::Arc;

    fn channel() -> (Outbound, mpsc::Receiver<Message>) {
        mpsc::channel(DEFAULT_OUTBOUND_CAPACITY)
    }

    fn decode(frame: Message) -> ServerMessage {
        ServerMessage::decode(frame.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register("ws1", tx).await;

        assert!(registry.is_connected("ws1", id).await);
        assert_eq!(registry.connection_count("ws1").await, 1);
        assert_eq!(registry.workspace_count().await, 1);

        assert!(registry.unregister("ws1", id).await);
        assert!(!registry.unregister("ws1", id).await);
        assert_eq!(registry.connection_count("ws1").await, 0);
        assert_eq!(registry.workspace_count().await, 0);
    }

    #[tokio::test]
    async fn test_client_ids_unique() {
        let registry = ConnectionRegistry::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let (tx, _rx) = channel();
            assert!(ids.insert(registry.register("ws1", tx).await));
        }
        assert_eq!(registry.connection_count("ws1").await, 50);
    }

    #[tokio::test]
    async fn test_send_to() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let id = registry.register("ws1", tx).await;

        registry
            .send_to("ws1", id, &ServerMessage::ack(Some("r1".into())))
            .await
            .unwrap();
        let msg = decode(rx.try_recv().unwrap());
        assert_eq!(msg.kind, ServerMessageType::Ack);
        assert_eq!(msg.request_id.as_deref(), Some("r1"));
        assert_eq!(registry.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register("ws1", tx).await;

        let err = registry
            .send_to("ws2", id, &ServerMessage::ack(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        let err = registry
            .send_to("ws1", Uuid::new_v4(), &ServerMessage::ack(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = channel();
        let id = registry.register("ws1", tx).await;
        drop(rx);

        let err = registry
            .send_to("ws1", id, &ServerMessage::ack(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Closed(c) if c == id));
        assert_eq!(registry.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let (tx_c, mut rx_c) = channel();
        let (tx_other, mut rx_other) = channel();
        let a = registry.register("ws1", tx_a).await;
        registry.register("ws1", tx_b).await;
        registry.register("ws1", tx_c).await;
        registry.register("ws2", tx_other).await;

        let payload = serde_json::json!({"id": "l1"});
        let msg = ServerMessage::action("removeLayer", payload.as_object().unwrap(), a, None);
        let delivered = registry.broadcast("ws1", &msg, Some(a)).await.unwrap();
        assert_eq!(delivered, 2);

        assert!(rx_a.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());
        for rx in [&mut rx_b, &mut rx_c] {
            let got = decode(rx.try_recv().unwrap());
            assert_eq!(got.kind, ServerMessageType::Action);
            assert_eq!(got.payload.unwrap()["actionType"], "removeLayer");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_dead_recipient() {
        let registry = ConnectionRegistry::new();
        let (tx_a, rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register("ws1", tx_a).await;
        registry.register("ws1", tx_b).await;
        drop(rx_a);

        let delivered = registry
            .broadcast("ws1", &ServerMessage::ack(None), None)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(registry.stats().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_full_queue_only_affects_its_owner() {
        let registry = ConnectionRegistry::new();
        let (tx_slow, mut rx_slow) = mpsc::channel(2);
        let (tx_b, mut rx_b) = channel();
        let (tx_c, mut rx_c) = channel();
        let slow = registry.register("ws1", tx_slow).await;
        registry.register("ws1", tx_b).await;
        registry.register("ws1", tx_c).await;

        // Nobody drains the slow connection
        for _ in 0..2 {
            let delivered = registry
                .broadcast("ws1", &ServerMessage::ack(None), None)
                .await
                .unwrap();
            assert_eq!(delivered, 3);
        }
        let delivered = registry
            .broadcast("ws1", &ServerMessage::ack(Some("r3".into())), None)
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        for rx in [&mut rx_b, &mut rx_c] {
            for _ in 0..2 {
                rx.try_recv().unwrap();
            }
            let last = decode(rx.try_recv().unwrap());
            assert_eq!(last.request_id.as_deref(), Some("r3"));
        }

        let err = registry
            .send_to("ws1", slow, &ServerMessage::ack(None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Full(c) if c == slow));

        let stats = registry.stats();
        assert_eq!(stats.messages_dropped, 2);
        assert_eq!(stats.delivery_failures, 2);
        assert_eq!(stats.messages_sent, 8);

        // Draining frees the slot again
        rx_slow.try_recv().unwrap();
        registry
            .send_to("ws1", slow, &ServerMessage::ack(None))
            .await
            .unwrap();
        assert!(registry.is_connected("ws1", slow).await);
    }

    #[tokio::test]
    async fn test_broadcast_empty_workspace() {
        let registry = ConnectionRegistry::new();
        let delivered = registry
            .broadcast("nobody", &ServerMessage::ack(None), None)
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_concurrent_register() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = channel();
                let ws = format!("ws{}", i % 4);
                let id = registry.register(&ws, tx).await;
                (ws, id, rx)
            }));
        }
        let mut conns = Vec::new();
        for h in handles {
            conns.push(h.await.unwrap());
        }
        assert_eq!(registry.workspace_count().await, 4);
        assert_eq!(registry.connection_count("ws0").await, 5);

        for (ws, id, _rx) in &conns {
            registry.unregister(ws, *id).await;
        }
        assert_eq!(registry.workspace_count().await, 0);
    }
}
