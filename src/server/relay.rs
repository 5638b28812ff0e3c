//! QUIC relay server
//!
//! Accepts connections, tracks presence, persists messages through the
//! storage collaborator, and pushes live deliveries and typing signals to
//! the addressed recipient's connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::messages::*;
use crate::server::connection::{ConnectionCommand, ConnectionHandler, ServerEvent};
use crate::server::presence::PresenceDirectory;
use crate::storage::MessageStore;
use crate::{generate_connection_id, ConnectionId, UserId};

/// ALPN protocol identifier
pub const ALPN: &[u8] = b"carelink";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4433".parse().expect("valid literal address"),
            max_connections: 10000,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Active connection tracking
struct ActiveConnection {
    /// Identity from the handshake, if any
    user_id: Option<UserId>,
    /// Command channel to this connection's handler
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Remote address
    remote_addr: SocketAddr,
    /// Connection time
    connected_at: u64,
}

/// Server statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: usize,
    pub online_users: usize,
}

/// Presence and message-relay server
pub struct RelayServer {
    /// Server configuration
    config: ServerConfig,
    /// QUIC endpoint
    endpoint: Option<Endpoint>,
    /// Presence directory; this server is its sole writer
    presence: Arc<PresenceDirectory>,
    /// Durable message storage
    store: Arc<dyn MessageStore>,
    /// Active connections by connection id
    connections: Arc<RwLock<HashMap<ConnectionId, ActiveConnection>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config,
            endpoint: None,
            presence: Arc::new(PresenceDirectory::new()),
            store,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the presence directory
    pub fn presence(&self) -> Arc<PresenceDirectory> {
        Arc::clone(&self.presence)
    }

    /// Cheap handle sharing the same state, for spawned tasks
    fn clone_ref(&self) -> Self {
        Self {
            config: self.config.clone(),
            endpoint: self.endpoint.clone(),
            presence: Arc::clone(&self.presence),
            store: Arc::clone(&self.store),
            connections: Arc::clone(&self.connections),
        }
    }

    /// Start the server
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting relay server on {}", self.config.bind_addr);

        // Self-signed certificate for development
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| RelayError::config(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| RelayError::config(format!("Failed to serialize cert: {}", e)))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        // Configure rustls
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?;

        tls_config.alpn_protocols = vec![ALPN.to_vec()];
        tls_config.max_early_data_size = 0;

        // Configure QUIC
        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(16u32.into());
        transport_config.max_idle_timeout(Some(
            self.config
                .idle_timeout
                .try_into()
                .map_err(|_| RelayError::config("Idle timeout out of range"))?,
        ));
        transport_config.datagram_receive_buffer_size(Some(65536));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(quic_server_config, self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;

        info!("Server listening on {}", endpoint.local_addr()?);

        self.endpoint = Some(endpoint.clone());

        self.accept_connections(endpoint).await
    }

    /// Accept incoming connections
    async fn accept_connections(&self, endpoint: Endpoint) -> Result<()> {
        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    {
                        let conns = self.connections.read().await;
                        if conns.len() >= self.config.max_connections {
                            warn!("Connection limit reached, rejecting connection");
                            incoming.refuse();
                            continue;
                        }
                    }

                    let server = self.clone_ref();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_incoming(incoming).await {
                            error!("Connection handling failed: {}", e);
                        }
                    });
                }
                None => {
                    warn!("Endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle an incoming connection
    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await?;
        let remote_addr = connection.remote_address();
        let conn_id = generate_connection_id();

        debug!("New connection {} from {}", conn_id, remote_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Track the connection before the handshake completes
        {
            let mut conns = self.connections.write().await;
            conns.insert(
                conn_id.clone(),
                ActiveConnection {
                    user_id: None,
                    command_tx: command_tx.clone(),
                    remote_addr,
                    connected_at: current_timestamp(),
                },
            );
        }

        let handler = Arc::new(ConnectionHandler::new(
            connection,
            conn_id.clone(),
            event_tx,
            command_rx,
        ));

        let handler_task = tokio::spawn(handler.run());

        let conn_id_clone = conn_id.clone();
        let server = self.clone_ref();
        let event_task = tokio::spawn(async move {
            server.process_events(conn_id_clone, event_rx).await;
        });

        tokio::select! {
            result = handler_task => {
                if let Err(e) = result {
                    error!("Handler task error: {}", e);
                }
            }
            _ = event_task => {}
        }

        self.cleanup_connection(&conn_id).await;

        Ok(())
    }

    /// Process events from a connection
    async fn process_events(
        &self,
        conn_id: String,
        mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = self.handle_event(&conn_id, event).await {
                warn!("Event handling error for {}: {}", conn_id, e);
            }
        }
    }

    /// Handle a single event from a connection
    async fn handle_event(&self, conn_id: &str, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Identified { user_id } => {
                self.handle_identified(conn_id, user_id).await?;
            }

            ServerEvent::AnonymousReady => {
                // Observers still get presence snapshots
                let snapshot = OnlineUsers {
                    users: self.presence.snapshot_user_ids().await,
                };
                self.send_to_connection(conn_id, ConnectionCommand::SendOnlineUsers(snapshot))
                    .await;
            }

            ServerEvent::SendMessage { user_id, request } => {
                self.handle_send_message(conn_id, user_id, request).await?;
            }

            ServerEvent::Typing {
                user_id,
                receiver_id,
            } => {
                self.forward_typing(user_id, receiver_id, true).await;
            }

            ServerEvent::StopTyping {
                user_id,
                receiver_id,
            } => {
                self.forward_typing(user_id, receiver_id, false).await;
            }

            ServerEvent::Disconnected { user_id, reason } => {
                debug!(
                    "Connection {} disconnected: {} (user: {:?})",
                    conn_id, reason, user_id
                );
            }
        }

        Ok(())
    }

    /// Record an identified handshake in the presence directory
    async fn handle_identified(&self, conn_id: &str, user_id: UserId) -> Result<()> {
        {
            let mut conns = self.connections.write().await;
            if let Some(conn) = conns.get_mut(conn_id) {
                conn.user_id = Some(user_id.clone());
            }
        }

        // Last connection wins; kick the superseded one
        let superseded = self
            .presence
            .register(user_id.clone(), conn_id.to_string())
            .await;

        if let Some(old_conn_id) = superseded {
            info!(
                "User {} reconnected on {}, closing old connection {}",
                user_id, conn_id, old_conn_id
            );
            self.send_to_connection(
                &old_conn_id,
                ConnectionCommand::Close("superseded by a new connection".to_string()),
            )
            .await;
        }

        self.broadcast_online_users().await;
        Ok(())
    }

    /// Persist a message, then forward it to the recipient if online
    async fn handle_send_message(
        &self,
        conn_id: &str,
        user_id: Option<UserId>,
        request: SendMessage,
    ) -> Result<()> {
        // The handshake identity is authoritative when present
        let sender_id = user_id.unwrap_or(request.sender_id);

        let message = Message::new(
            sender_id,
            request.receiver_id,
            request.content,
            request.media_url,
        );

        // Persist first; an unpersisted message must never look delivered
        if let Err(e) = self.store.create_message(&message).await {
            warn!("Failed to persist message {}: {}", message.id, e);
            let err = ErrorEvent::storage_failed(e.message().to_string())
                .with_context(message.id.clone());
            self.send_to_connection(conn_id, ConnectionCommand::SendError(err))
                .await;
            return Ok(());
        }

        match self.presence.lookup(&message.receiver_id).await {
            Some(receiver_conn) => {
                debug!(
                    "Delivering message {} to {} on {}",
                    message.id, message.receiver_id, receiver_conn
                );
                self.send_to_connection(
                    &receiver_conn,
                    ConnectionCommand::Deliver(NewMessage { message }),
                )
                .await;
            }
            None => {
                // Offline recipients read it from storage later
                debug!(
                    "Receiver {} offline, message {} persisted only",
                    message.receiver_id, message.id
                );
            }
        }

        Ok(())
    }

    /// Forward a typing signal to the recipient if online
    async fn forward_typing(&self, user_id: UserId, receiver_id: UserId, started: bool) {
        let receiver_conn = match self.presence.lookup(&receiver_id).await {
            Some(conn) => conn,
            None => return, // Offline, the signal evaporates
        };

        let command = if started {
            ConnectionCommand::SendTyping(Typing {
                receiver_id: None,
                user_id: Some(user_id),
            })
        } else {
            ConnectionCommand::SendStopTyping(StopTyping {
                receiver_id: None,
                user_id: Some(user_id),
            })
        };

        self.send_to_connection(&receiver_conn, command).await;
    }

    /// Remove a connection and, if it was still current, its presence entry
    async fn cleanup_connection(&self, conn_id: &str) {
        let removed = {
            let mut conns = self.connections.write().await;
            conns.remove(conn_id)
        };

        if let Some(conn) = removed {
            debug!("Cleaned up connection {} from {}", conn_id, conn.remote_addr);
        }

        // A stale disconnect after re-registration leaves presence untouched
        if let Some(user_id) = self.presence.unregister(conn_id).await {
            info!("User {} went offline", user_id);
            self.broadcast_online_users().await;
        }
    }

    /// Push the current presence snapshot to every connection
    async fn broadcast_online_users(&self) {
        let snapshot = OnlineUsers {
            users: self.presence.snapshot_user_ids().await,
        };

        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter() {
            if conn
                .command_tx
                .send(ConnectionCommand::SendOnlineUsers(snapshot.clone()))
                .is_err()
            {
                debug!("Connection {} gone, skipping broadcast", conn_id);
            }
        }
    }

    /// Send a command to a single connection; failures are best-effort
    async fn send_to_connection(&self, conn_id: &str, command: ConnectionCommand) {
        let conns = self.connections.read().await;
        match conns.get(conn_id) {
            Some(conn) => {
                if conn.command_tx.send(command).is_err() {
                    debug!("Connection {} channel closed", conn_id);
                }
            }
            None => {
                debug!("Connection {} not found", conn_id);
            }
        }
    }

    /// Current server statistics
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.read().await.len(),
            online_users: self.presence.online_count().await,
        }
    }

    /// Stop accepting connections and close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down relay server");

        {
            let conns = self.connections.read().await;
            for conn in conns.values() {
                let _ = conn
                    .command_tx
                    .send(ConnectionCommand::Close("server shutdown".to_string()));
            }
        }

        if let Some(endpoint) = &self.endpoint {
            endpoint.close(0u32.into(), b"server shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMessageStore;
    use async_trait::async_trait;

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn create_message(&self, _message: &Message) -> Result<()> {
            Err(RelayError::storage("write rejected"))
        }

        async fn conversation(&self, _a: &str, _b: &str) -> Result<Vec<Message>> {
            Ok(vec![])
        }

        async fn mark_read(&self, _message_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_server(store: Arc<dyn MessageStore>) -> RelayServer {
        RelayServer::new(ServerConfig::default(), store)
    }

    /// Register a fake connection and return its command receiver
    async fn add_connection(
        server: &RelayServer,
        conn_id: &str,
    ) -> mpsc::UnboundedReceiver<ConnectionCommand> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut conns = server.connections.write().await;
        conns.insert(
            conn_id.to_string(),
            ActiveConnection {
                user_id: None,
                command_tx,
                remote_addr: "127.0.0.1:0".parse().unwrap(),
                connected_at: current_timestamp(),
            },
        );
        command_rx
    }

    async fn identify(server: &RelayServer, conn_id: &str, user_id: &str) {
        server
            .handle_event(
                conn_id,
                ServerEvent::Identified {
                    user_id: user_id.to_string(),
                },
            )
            .await
            .unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>) -> Vec<ConnectionCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    fn send_message(sender: &str, receiver: &str, content: &str) -> SendMessage {
        SendMessage {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: content.to_string(),
            media_url: None,
        }
    }

    #[tokio::test]
    async fn test_identify_broadcasts_snapshot_to_all() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;

        identify(&server, "c1", "u1").await;

        for rx in [&mut rx1, &mut rx2] {
            let cmds = drain(rx);
            assert_eq!(cmds.len(), 1);
            match &cmds[0] {
                ConnectionCommand::SendOnlineUsers(snapshot) => {
                    assert_eq!(snapshot.users, vec!["u1".to_string()]);
                }
                other => panic!("Expected OnlineUsers, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_anonymous_gets_snapshot() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        identify(&server, "c1", "u1").await;
        drain(&mut rx1);

        let mut rx2 = add_connection(&server, "c2").await;
        server
            .handle_event("c2", ServerEvent::AnonymousReady)
            .await
            .unwrap();

        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ConnectionCommand::SendOnlineUsers(snapshot) => {
                assert_eq!(snapshot.users, vec!["u1".to_string()]);
            }
            other => panic!("Expected OnlineUsers, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_to_online_receiver() {
        let store = Arc::new(MemoryMessageStore::new());
        let server = test_server(store.clone());
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        server
            .handle_event(
                "c1",
                ServerEvent::SendMessage {
                    user_id: Some("u1".to_string()),
                    request: send_message("u1", "u2", "hello"),
                },
            )
            .await
            .unwrap();

        // Persisted first
        assert_eq!(store.len().await, 1);

        // Delivered to the recipient only
        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ConnectionCommand::Deliver(delivery) => {
                assert_eq!(delivery.message.sender_id, "u1");
                assert_eq!(delivery.message.content, "hello");
                assert!(!delivery.message.id.is_empty());
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_offline_receiver_persists_without_delivery() {
        let store = Arc::new(MemoryMessageStore::new());
        let server = test_server(store.clone());
        let mut rx1 = add_connection(&server, "c1").await;
        identify(&server, "c1", "u1").await;
        drain(&mut rx1);

        server
            .handle_event(
                "c1",
                ServerEvent::SendMessage {
                    user_id: Some("u1".to_string()),
                    request: send_message("u1", "u2", "are you there?"),
                },
            )
            .await
            .unwrap();

        // Stored, nothing pushed anywhere
        assert_eq!(store.len().await, 1);
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_reports_to_sender_and_skips_relay() {
        let server = test_server(Arc::new(FailingStore));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        server
            .handle_event(
                "c1",
                ServerEvent::SendMessage {
                    user_id: Some("u1".to_string()),
                    request: send_message("u1", "u2", "hello"),
                },
            )
            .await
            .unwrap();

        let cmds = drain(&mut rx1);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ConnectionCommand::SendError(err) => {
                assert_eq!(err.code, ErrorEvent::STORAGE_FAILED);
            }
            other => panic!("Expected SendError, got {:?}", other),
        }
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_handshake_identity_overrides_wire_sender() {
        let store = Arc::new(MemoryMessageStore::new());
        let server = test_server(store.clone());
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        // Wire claims a different sender; the handshake identity wins
        server
            .handle_event(
                "c1",
                ServerEvent::SendMessage {
                    user_id: Some("u1".to_string()),
                    request: send_message("impostor", "u2", "hello"),
                },
            )
            .await
            .unwrap();

        let cmds = drain(&mut rx2);
        match &cmds[0] {
            ConnectionCommand::Deliver(delivery) => {
                assert_eq!(delivery.message.sender_id, "u1");
            }
            other => panic!("Expected Deliver, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_typing_forwarded_with_sender_filled() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        server
            .handle_event(
                "c1",
                ServerEvent::Typing {
                    user_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                },
            )
            .await
            .unwrap();

        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ConnectionCommand::SendTyping(typing) => {
                assert_eq!(typing.user_id.as_deref(), Some("u1"));
                assert!(typing.receiver_id.is_none());
            }
            other => panic!("Expected SendTyping, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_typing_without_preceding_typing() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        // Stop without start, twice; both forwarded, both harmless
        for _ in 0..2 {
            server
                .handle_event(
                    "c1",
                    ServerEvent::StopTyping {
                        user_id: "u1".to_string(),
                        receiver_id: "u2".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 2);
        for cmd in &cmds {
            match cmd {
                ConnectionCommand::SendStopTyping(stop) => {
                    assert_eq!(stop.user_id.as_deref(), Some("u1"));
                }
                other => panic!("Expected SendStopTyping, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_typing_to_offline_receiver_dropped() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        identify(&server, "c1", "u1").await;
        drain(&mut rx1);

        server
            .handle_event(
                "c1",
                ServerEvent::Typing {
                    user_id: "u1".to_string(),
                    receiver_id: "u2".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_connection() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        identify(&server, "c1", "u1").await;
        drain(&mut rx1);

        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c2", "u1").await;

        // Old connection told to close, new one holds the presence entry
        let cmds = drain(&mut rx1);
        assert!(cmds
            .iter()
            .any(|cmd| matches!(cmd, ConnectionCommand::Close(_))));
        assert_eq!(server.presence.lookup("u1").await.as_deref(), Some("c2"));
        drain(&mut rx2);
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_user_online() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        identify(&server, "c1", "u1").await;
        drain(&mut rx1);

        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c2", "u1").await;
        drain(&mut rx2);

        // The old connection's teardown must not knock the user offline
        server.cleanup_connection("c1").await;

        assert!(server.presence.is_online("u1").await);
        // No offline broadcast was triggered
        assert!(drain(&mut rx2).is_empty());

        // The current connection's teardown does
        server.cleanup_connection("c2").await;
        assert!(!server.presence.is_online("u1").await);
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_updated_snapshot() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let mut rx1 = add_connection(&server, "c1").await;
        let mut rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;
        identify(&server, "c2", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        server.cleanup_connection("c1").await;

        let cmds = drain(&mut rx2);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            ConnectionCommand::SendOnlineUsers(snapshot) => {
                assert_eq!(snapshot.users, vec!["u2".to_string()]);
            }
            other => panic!("Expected OnlineUsers, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let server = test_server(Arc::new(MemoryMessageStore::new()));
        let _rx1 = add_connection(&server, "c1").await;
        let _rx2 = add_connection(&server, "c2").await;
        identify(&server, "c1", "u1").await;

        let stats = server.stats().await;
        assert_eq!(
            stats,
            ServerStats {
                connections: 2,
                online_users: 1,
            }
        );
    }
}
