//! QUIC relay client
//!
//! Holds at most one live connection per session: `connect` tears down any
//! previous connection before opening a new one, so event subscriptions never
//! outlive the connection they were created for.

pub mod typing;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, DecodedEvent, Encodable};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::protocol::messages::*;
use crate::server::relay::ALPN;
use crate::UserId;

pub use typing::TypingTracker;

/// Relay client configuration
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Client bind address (use 0.0.0.0:0 for auto)
    pub bind_addr: SocketAddr,
    /// Server name for TLS (self-signed dev certs use "localhost")
    pub server_name: String,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Quiet period after the last keystroke before auto stop-typing
    pub typing_quiet_period: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:4433".parse().expect("valid literal address"),
            bind_addr: "0.0.0.0:0".parse().expect("valid literal address"),
            server_name: "localhost".to_string(),
            connect_timeout_secs: 10,
            typing_quiet_period: Duration::from_secs(1),
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Handshake completed; the server assigned this session id
    Connected { session_id: String },
    /// Disconnected from server
    Disconnected(String),
    /// A message addressed to this user arrived
    MessageReceived(Message),
    /// Presence snapshot changed
    OnlineUsers(Vec<UserId>),
    /// A peer started typing to this user
    Typing { user_id: UserId },
    /// A peer stopped typing
    StopTyping { user_id: UserId },
    /// Error occurred
    Error(RelayError),
}

/// Outbound traffic, routed to the control stream or to datagrams
#[derive(Debug)]
pub(crate) enum Outbound {
    Control(Bytes),
    Datagram(Bytes),
}

/// QUIC relay client
pub struct RelayClient {
    config: RelayClientConfig,
    identity: Option<UserId>,
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    writer_tx: Option<mpsc::UnboundedSender<Outbound>>,
    typing: Option<TypingTracker>,
    online_users: Arc<RwLock<HashSet<UserId>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Create a new relay client with the given configuration
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            config,
            identity: None,
            connection: None,
            endpoint: None,
            writer_tx: None,
            typing: None,
            online_users: Arc::new(RwLock::new(HashSet::new())),
            tasks: Vec::new(),
        }
    }

    /// Connect to the relay server, optionally attaching a user identity
    ///
    /// Any previous connection is closed first, so there is never more than
    /// one live connection (or event subscription) per client.
    pub async fn connect(
        &mut self,
        identity: Option<UserId>,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        self.disconnect().await?;

        info!("Connecting to relay server at {}", self.config.server_addr);
        self.identity = identity.clone();

        let client_config = self.configure_client()?;

        let mut endpoint = Endpoint::client(self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config);
        self.endpoint = Some(endpoint.clone());

        let connecting = endpoint
            .connect(self.config.server_addr, &self.config.server_name)
            .map_err(|e| RelayError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| RelayError::timeout("Connection timeout"))?
        .map_err(|e| RelayError::connection(format!("Failed to connect: {}", e)))?;

        self.connection = Some(connection.clone());

        // The client opens the control stream and speaks first
        let (mut send, mut recv) = connection.open_bi().await?;

        let hello = Hello {
            user_id: identity.clone(),
        };
        Self::write_frame(&mut send, &hello).await?;

        // Block until the server acknowledges; buffered bytes past the ack
        // carry over into the reader task
        let mut codec = FrameCodec::new();
        let ack = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            Self::read_hello_ack(&mut recv, &mut codec),
        )
        .await
        .map_err(|_| RelayError::timeout("Handshake timeout"))??;

        info!(
            "Connected, session {} (identity: {:?})",
            ack.session_id, identity
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        self.writer_tx = Some(writer_tx.clone());
        self.typing = Some(TypingTracker::spawn(
            self.config.typing_quiet_period,
            writer_tx.clone(),
        ));
        self.online_users = Arc::new(RwLock::new(HashSet::new()));

        let _ = event_tx.send(ClientEvent::Connected {
            session_id: ack.session_id,
        });

        self.tasks.push(Self::spawn_writer(
            connection.clone(),
            send,
            writer_rx,
        ));
        self.tasks.push(Self::spawn_reader(
            recv,
            codec,
            event_tx.clone(),
            writer_tx,
            Arc::clone(&self.online_users),
        ));
        self.tasks
            .push(Self::spawn_datagram_receiver(connection, event_tx));

        Ok(event_rx)
    }

    /// Configure the QUIC client
    fn configure_client(&self) -> Result<QuinnClientConfig> {
        // Accepts self-signed certificates. Development/testing only.
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        crypto.alpn_protocols = vec![ALPN.to_vec()];

        Ok(QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?,
        )))
    }

    async fn write_frame<T: Encodable>(send: &mut SendStream, msg: &T) -> Result<()> {
        let data = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?
            .encode_to_bytes();
        send.write_all(&data).await?;
        Ok(())
    }

    /// Read frames until the HelloAck arrives
    ///
    /// Broadcasts triggered by other connections can land here first; they
    /// are skipped, the post-handshake snapshot supersedes them.
    async fn read_hello_ack(recv: &mut RecvStream, codec: &mut FrameCodec) -> Result<HelloAck> {
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(frame) = codec
                .decode_next()
                .map_err(|e| RelayError::protocol(format!("Frame decode error: {}", e)))?
            {
                if frame.frame_type != FrameType::HelloAck {
                    debug!("Skipping pre-handshake frame {:?}", frame.frame_type);
                    continue;
                }
                return HelloAck::decode_frame(&frame)
                    .map_err(|e| RelayError::handshake(format!("Invalid HelloAck: {}", e)));
            }

            match recv.read(&mut buf).await? {
                Some(n) => codec.feed(&buf[..n]),
                None => {
                    return Err(RelayError::handshake(
                        "Connection closed during handshake",
                    ))
                }
            }
        }
    }

    /// Writer task: single owner of the control send stream and datagrams
    fn spawn_writer(
        connection: Connection,
        mut send: SendStream,
        mut writer_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outbound) = writer_rx.recv().await {
                let result = match outbound {
                    Outbound::Control(data) => send.write_all(&data).await.map_err(|e| {
                        RelayError::network(format!("Control write failed: {}", e))
                    }),
                    Outbound::Datagram(data) => connection
                        .send_datagram(data)
                        .map_err(RelayError::from),
                };
                if let Err(e) = result {
                    debug!("Writer stopping: {}", e);
                    break;
                }
            }
        })
    }

    /// Reader task: control stream frames become client events
    fn spawn_reader(
        mut recv: RecvStream,
        mut codec: FrameCodec,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
        writer_tx: mpsc::UnboundedSender<Outbound>,
        online_users: Arc<RwLock<HashSet<UserId>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                // Drain buffered frames before reading more
                loop {
                    let frame = match codec.decode_next() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            let _ = event_tx.send(ClientEvent::Error(RelayError::protocol(
                                format!("Frame decode error: {}", e),
                            )));
                            return;
                        }
                    };

                    Self::handle_server_frame(&frame, &event_tx, &writer_tx, &online_users).await;
                }

                match recv.read(&mut buf).await {
                    Ok(Some(n)) => codec.feed(&buf[..n]),
                    Ok(None) => {
                        let _ = event_tx
                            .send(ClientEvent::Disconnected("stream finished".to_string()));
                        return;
                    }
                    Err(e) => {
                        let _ = event_tx
                            .send(ClientEvent::Disconnected(format!("Connection lost: {}", e)));
                        return;
                    }
                }
            }
        })
    }

    async fn handle_server_frame(
        frame: &Frame,
        event_tx: &mpsc::UnboundedSender<ClientEvent>,
        writer_tx: &mpsc::UnboundedSender<Outbound>,
        online_users: &Arc<RwLock<HashSet<UserId>>>,
    ) {
        let event = match DecodedEvent::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to decode server frame: {}", e);
                let _ = event_tx.send(ClientEvent::Error(RelayError::serialization(format!(
                    "Failed to decode server frame: {}",
                    e
                ))));
                return;
            }
        };

        match event {
            DecodedEvent::NewMessage(delivery) => {
                let _ = event_tx.send(ClientEvent::MessageReceived(delivery.message));
            }
            DecodedEvent::OnlineUsers(snapshot) => {
                {
                    let mut users = online_users.write().await;
                    users.clear();
                    users.extend(snapshot.users.iter().cloned());
                }
                let _ = event_tx.send(ClientEvent::OnlineUsers(snapshot.users));
            }
            DecodedEvent::Ping(ping) => {
                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                if let Ok(frame) = pong.encode_frame() {
                    let _ = writer_tx.send(Outbound::Control(frame.encode_to_bytes()));
                }
            }
            DecodedEvent::Pong(_) => {}
            DecodedEvent::Error(err) => {
                warn!("Server reported error {}: {}", err.code, err.message);
                let _ = event_tx.send(ClientEvent::Error(RelayError::protocol(err.message)));
            }
            other => {
                debug!("Ignoring unexpected frame {:?}", other.frame_type());
            }
        }
    }

    /// Datagram task: typing signals become client events
    fn spawn_datagram_receiver(
        connection: Connection,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let data = match connection.read_datagram().await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("Datagram receive ended: {}", e);
                        return;
                    }
                };

                let frame = match Frame::decode_complete(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Invalid datagram frame: {}", e);
                        continue;
                    }
                };

                match DecodedEvent::decode(&frame) {
                    Ok(DecodedEvent::Typing(typing)) => {
                        if let Some(user_id) = typing.user_id {
                            let _ = event_tx.send(ClientEvent::Typing { user_id });
                        }
                    }
                    Ok(DecodedEvent::StopTyping(stop)) => {
                        if let Some(user_id) = stop.user_id {
                            let _ = event_tx.send(ClientEvent::StopTyping { user_id });
                        }
                    }
                    Ok(other) => {
                        debug!("Ignoring datagram frame {:?}", other.frame_type());
                    }
                    Err(e) => {
                        warn!("Failed to decode datagram: {}", e);
                    }
                }
            }
        })
    }

    /// Ask the server to persist and relay a direct message
    pub async fn send_message(
        &self,
        receiver_id: UserId,
        content: String,
        media_url: Option<String>,
    ) -> Result<()> {
        let sender_id = self
            .identity
            .clone()
            .ok_or_else(|| RelayError::handshake("Cannot send messages without an identity"))?;

        let writer_tx = self
            .writer_tx
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to server"))?;

        let request = SendMessage {
            sender_id,
            receiver_id,
            content,
            media_url,
        };

        let data = request
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?
            .encode_to_bytes();

        writer_tx
            .send(Outbound::Control(data))
            .map_err(|_| RelayError::connection("Connection closed"))?;

        Ok(())
    }

    /// Report a keystroke in the composer addressed to `receiver_id`
    ///
    /// Debounced: the first keystroke emits a typing signal, a quiet period
    /// emits the stop automatically.
    pub fn notify_typing(&self, receiver_id: UserId) -> Result<()> {
        let typing = self
            .typing
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to server"))?;
        typing.keystroke(receiver_id);
        Ok(())
    }

    /// Explicitly stop typing (message sent, composer cleared)
    pub fn stop_typing(&self, receiver_id: UserId) -> Result<()> {
        let typing = self
            .typing
            .as_ref()
            .ok_or_else(|| RelayError::connection("Not connected to server"))?;
        typing.stop(receiver_id);
        Ok(())
    }

    /// Current known set of online users, sorted
    pub async fn online_users(&self) -> Vec<UserId> {
        let users = self.online_users.read().await;
        let mut out: Vec<UserId> = users.iter().cloned().collect();
        out.sort();
        out
    }

    /// Check whether a user is in the last presence snapshot
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.online_users.read().await.contains(user_id)
    }

    /// Disconnect and abort all background tasks
    pub async fn disconnect(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(typing) = self.typing.take() {
            typing.shutdown();
        }

        self.writer_tx = None;

        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"client disconnect");
            info!("Disconnected from relay server");
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"client shutdown");
        }

        self.identity = None;
        self.online_users.write().await.clear();

        Ok(())
    }

    /// Get the identity attached at connect time
    pub fn identity(&self) -> Option<&UserId> {
        self.identity.as_ref()
    }

    /// Check if connected to server
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Certificate verifier that accepts any certificate (INSECURE - for development only)
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::ECDSA_SHA1_Legacy,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = RelayClientConfig::default();
        assert_eq!(config.server_addr.port(), 4433);
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.server_name, "localhost");
        assert_eq!(config.typing_quiet_period, Duration::from_secs(1));
    }

    #[test]
    fn test_client_creation() {
        let config = RelayClientConfig::default();
        let client = RelayClient::new(config.clone());

        assert_eq!(client.config.server_addr, config.server_addr);
        assert!(client.identity.is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let mut client = RelayClient::new(RelayClientConfig::default());
        assert!(client.disconnect().await.is_ok());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_message_requires_connection() {
        let client = RelayClient::new(RelayClientConfig::default());
        let result = client
            .send_message("u2".to_string(), "hi".to_string(), None)
            .await;
        assert!(result.is_err());
    }
}
