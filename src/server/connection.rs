//! Per-connection handler for the relay server
//!
//! Owns one QUIC connection: runs the handshake, reads frames from the
//! control stream and datagrams, and converts them into typed [`ServerEvent`]s
//! for the relay server. Outbound traffic arrives as [`ConnectionCommand`]s.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::{RelayError, Result};
use crate::protocol::codec::{Decodable, Encodable};
use crate::protocol::frame::{Frame, FrameCodec, FrameType};
use crate::protocol::messages::*;
use crate::{ConnectionId, UserId};

/// Keepalive ping cadence on the control stream
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Events emitted by a connection handler to the relay server
#[derive(Debug)]
pub enum ServerEvent {
    /// Handshake completed with a user identity attached
    Identified { user_id: UserId },

    /// Handshake completed without identity (observer mode)
    AnonymousReady,

    /// Client asked to persist and relay a direct message
    SendMessage {
        /// Identity from the handshake, preferred over the wire sender_id
        user_id: Option<UserId>,
        request: SendMessage,
    },

    /// Client started typing to a peer
    Typing {
        user_id: UserId,
        receiver_id: UserId,
    },

    /// Client stopped typing to a peer
    StopTyping {
        user_id: UserId,
        receiver_id: UserId,
    },

    /// Connection is gone; emitted exactly once, last
    Disconnected {
        user_id: Option<UserId>,
        reason: String,
    },
}

/// Commands the relay server sends to a connection handler
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Deliver a freshly persisted message on the control stream
    Deliver(NewMessage),

    /// Push a presence snapshot
    SendOnlineUsers(OnlineUsers),

    /// Forward a typing signal as a datagram
    SendTyping(Typing),

    /// Forward a stop-typing signal as a datagram
    SendStopTyping(StopTyping),

    /// Report an error to the client
    SendError(ErrorEvent),

    /// Close the connection
    Close(String),
}

/// State of the connection handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for Hello from client
    AwaitingHello,
    /// Hello received and acknowledged
    Ready,
}

/// Per-connection handler
pub struct ConnectionHandler {
    /// Underlying QUIC connection
    connection: Connection,

    /// Identity from the handshake, if any
    user_id: RwLock<Option<UserId>>,

    /// Handshake state
    handshake_state: RwLock<HandshakeState>,

    /// Connection id, also sent to the client as the session id
    connection_id: ConnectionId,

    /// Channel for sending events to the relay server
    event_tx: mpsc::UnboundedSender<ServerEvent>,

    /// Channel for receiving commands from the relay server
    command_rx: RwLock<Option<mpsc::UnboundedReceiver<ConnectionCommand>>>,

    /// Control stream sender
    control_send: RwLock<Option<SendStream>>,

    /// Last activity timestamp
    last_activity: RwLock<Instant>,

    /// Ping timestamp for RTT calculation
    last_ping_time: RwLock<Option<Instant>>,
}

impl ConnectionHandler {
    pub fn new(
        connection: Connection,
        connection_id: ConnectionId,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) -> Self {
        Self {
            connection,
            user_id: RwLock::new(None),
            handshake_state: RwLock::new(HandshakeState::AwaitingHello),
            connection_id,
            event_tx,
            command_rx: RwLock::new(Some(command_rx)),
            control_send: RwLock::new(None),
            last_activity: RwLock::new(Instant::now()),
            last_ping_time: RwLock::new(None),
        }
    }

    /// Get the remote address
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Get the handshake identity, if any
    pub async fn user_id(&self) -> Option<UserId> {
        self.user_id.read().await.clone()
    }

    /// Check whether the handshake has completed
    pub async fn is_ready(&self) -> bool {
        *self.handshake_state.read().await == HandshakeState::Ready
    }

    /// Update last activity
    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Run the connection handler
    /// This is the main entry point that should be spawned as a task
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.remote_address();
        info!("New connection {} from {}", self.connection_id, addr);

        let result = self.accept_and_run_arc(Arc::clone(&self)).await;

        // Emit the terminal event on the way out, whatever happened
        let user_id = self.user_id().await;
        let reason = match &result {
            Ok(()) => "normal".to_string(),
            Err(e) => e.to_string(),
        };

        let _ = self
            .event_tx
            .send(ServerEvent::Disconnected { user_id, reason });

        info!("Connection {} from {} closed", self.connection_id, addr);
        result
    }

    /// Accept the control stream and run the per-connection tasks
    async fn accept_and_run_arc(self: &Arc<Self>, handler: Arc<Self>) -> Result<()> {
        // The client opens the control bidirectional stream first
        let (send, recv) = self.connection.accept_bi().await.map_err(|e| {
            RelayError::connection(format!("Failed to accept control stream: {}", e))
        })?;

        {
            let mut control = self.control_send.write().await;
            *control = Some(send);
        }

        debug!("Control stream accepted from {}", self.remote_address());

        // Spawn control stream receiver
        let recv_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Err(e) = h.handle_control_stream_arc(recv).await {
                    debug!("Control stream ended: {}", e);
                }
            })
        };

        // Spawn command handler
        let cmd_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.handle_commands_arc().await;
            })
        };

        // Spawn datagram receiver
        let dgram_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.handle_datagrams_arc().await;
            })
        };

        // Spawn ping task
        let ping_handle = {
            let h = Arc::clone(&handler);
            tokio::spawn(async move {
                h.ping_loop_arc().await;
            })
        };

        // Any task finishing means the connection is done
        tokio::select! {
            _ = recv_handle => {},
            _ = cmd_handle => {},
            _ = dgram_handle => {},
            _ = ping_handle => {},
        }

        Ok(())
    }

    /// Read frames off the control stream
    async fn handle_control_stream_arc(self: &Arc<Self>, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::new();
        let mut buf = vec![0u8; 4096];

        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    self.touch().await;
                    codec.feed(&buf[..n]);

                    // Process all available frames
                    loop {
                        match codec.decode_next() {
                            Ok(Some(frame)) => {
                                if let Err(e) = self.handle_control_frame(frame).await {
                                    warn!("Error handling control frame: {}", e);
                                    self.send_error(e).await?;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                return Err(RelayError::protocol(format!(
                                    "Frame decode error: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!("Control stream finished");
                    break;
                }
                Err(e) => {
                    return Err(RelayError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    /// Handle a single control frame
    async fn handle_control_frame(&self, frame: Frame) -> Result<()> {
        let state = *self.handshake_state.read().await;

        match (state, frame.frame_type) {
            // Handshake: Hello, identity optional
            (HandshakeState::AwaitingHello, FrameType::Hello) => {
                let hello = Hello::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Hello: {}", e)))?;

                let hello_ack = HelloAck {
                    session_id: self.connection_id.clone(),
                };
                self.send_control_frame(&hello_ack).await?;

                *self.handshake_state.write().await = HandshakeState::Ready;

                match hello.user_id {
                    Some(user_id) => {
                        *self.user_id.write().await = Some(user_id.clone());
                        info!(
                            "User {} connected on {} from {}",
                            user_id,
                            self.connection_id,
                            self.remote_address()
                        );
                        let _ = self.event_tx.send(ServerEvent::Identified { user_id });
                    }
                    None => {
                        debug!(
                            "Anonymous connection {} from {}",
                            self.connection_id,
                            self.remote_address()
                        );
                        let _ = self.event_tx.send(ServerEvent::AnonymousReady);
                    }
                }
            }

            // Ping/Pong
            (HandshakeState::Ready, FrameType::Ping) => {
                let ping = Ping::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Ping: {}", e)))?;

                let pong = Pong {
                    timestamp: ping.timestamp,
                };
                self.send_control_frame(&pong).await?;
            }

            (HandshakeState::Ready, FrameType::Pong) => {
                let _pong = Pong::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Pong: {}", e)))?;

                if let Some(ping_time) = *self.last_ping_time.read().await {
                    let rtt = ping_time.elapsed();
                    debug!("RTT for {}: {:?}", self.connection_id, rtt);
                }
            }

            // Message relay request
            (HandshakeState::Ready, FrameType::SendMessage) => {
                let request = SendMessage::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid SendMessage: {}", e)))?;

                let user_id = self.user_id().await;
                let _ = self
                    .event_tx
                    .send(ServerEvent::SendMessage { user_id, request });
            }

            // Goodbye
            (_, FrameType::Goodbye) => {
                let goodbye = Goodbye::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Goodbye: {}", e)))?;

                info!(
                    "Connection {} sent Goodbye: {}",
                    self.connection_id, goodbye.reason
                );
                self.connection.close(0u32.into(), goodbye.reason.as_bytes());
            }

            // Invalid state/frame combination
            (state, frame_type) => {
                warn!("Unexpected frame {:?} in state {:?}", frame_type, state);
                return Err(RelayError::protocol(format!(
                    "Unexpected frame {:?} in state {:?}",
                    frame_type, state
                )));
            }
        }

        Ok(())
    }

    /// Receive typing datagrams
    async fn handle_datagrams_arc(self: &Arc<Self>) {
        loop {
            match self.connection.read_datagram().await {
                Ok(data) => {
                    self.touch().await;

                    if let Err(e) = self.handle_datagram(data).await {
                        warn!("Datagram handling error: {}", e);
                    }
                }
                Err(e) => {
                    debug!("Datagram receive ended: {}", e);
                    break;
                }
            }
        }
    }

    /// Handle a single datagram
    async fn handle_datagram(&self, data: Bytes) -> Result<()> {
        if !self.is_ready().await {
            return Ok(()); // Silently ignore datagrams before the handshake
        }

        // Typing signals only make sense with an identity attached
        let user_id = match self.user_id().await {
            Some(id) => id,
            None => return Ok(()),
        };

        let frame = Frame::decode_complete(&data)
            .map_err(|e| RelayError::protocol(format!("Invalid datagram frame: {}", e)))?;

        match frame.frame_type {
            FrameType::Typing => {
                let msg = Typing::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid Typing: {}", e)))?;

                if let Some(receiver_id) = msg.receiver_id {
                    let _ = self.event_tx.send(ServerEvent::Typing {
                        user_id,
                        receiver_id,
                    });
                }
            }

            FrameType::StopTyping => {
                let msg = StopTyping::decode_frame(&frame)
                    .map_err(|e| RelayError::protocol(format!("Invalid StopTyping: {}", e)))?;

                if let Some(receiver_id) = msg.receiver_id {
                    let _ = self.event_tx.send(ServerEvent::StopTyping {
                        user_id,
                        receiver_id,
                    });
                }
            }

            _ => {
                warn!("Unexpected datagram frame type: {:?}", frame.frame_type);
            }
        }

        Ok(())
    }

    /// Drain commands from the relay server
    async fn handle_commands_arc(self: &Arc<Self>) {
        let rx = self.command_rx.write().await.take();
        let mut rx = match rx {
            Some(rx) => rx,
            None => return,
        };

        while let Some(cmd) = rx.recv().await {
            if let Err(e) = self.handle_command(cmd).await {
                warn!("Command handling error: {}", e);
            }
        }
    }

    /// Handle a single command
    async fn handle_command(&self, cmd: ConnectionCommand) -> Result<()> {
        match cmd {
            ConnectionCommand::Deliver(msg) => {
                self.send_control_frame(&msg).await?;
            }
            ConnectionCommand::SendOnlineUsers(msg) => {
                self.send_control_frame(&msg).await?;
            }
            ConnectionCommand::SendTyping(msg) => {
                self.send_datagram(&msg).await?;
            }
            ConnectionCommand::SendStopTyping(msg) => {
                self.send_datagram(&msg).await?;
            }
            ConnectionCommand::SendError(msg) => {
                self.send_control_frame(&msg).await?;
            }
            ConnectionCommand::Close(reason) => {
                self.connection.close(0u32.into(), reason.as_bytes());
            }
        }

        Ok(())
    }

    /// Send a frame on the control stream
    async fn send_control_frame<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        let mut control = self.control_send.write().await;
        if let Some(send) = control.as_mut() {
            let data = frame.encode_to_bytes();
            send.write_all(&data).await.map_err(|e| {
                RelayError::network(format!("Failed to write to control stream: {}", e))
            })?;
        } else {
            return Err(RelayError::connection("Control stream not open"));
        }

        Ok(())
    }

    /// Send a datagram
    async fn send_datagram<T: Encodable>(&self, msg: &T) -> Result<()> {
        let frame = msg
            .encode_frame()
            .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;

        let data = frame.encode_to_bytes();
        self.connection
            .send_datagram(data)
            .map_err(|e| RelayError::network(format!("Failed to send datagram: {}", e)))?;

        Ok(())
    }

    /// Send an error frame
    async fn send_error(&self, error: RelayError) -> Result<()> {
        let err = ErrorEvent::new(error.code(), error.message().to_string());
        self.send_control_frame(&err).await
    }

    /// Ping loop for keepalive
    async fn ping_loop_arc(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        // The first tick fires immediately, before the handshake
        interval.tick().await;

        loop {
            interval.tick().await;

            if !self.is_ready().await {
                continue;
            }

            let ping = Ping {
                timestamp: current_timestamp(),
            };

            *self.last_ping_time.write().await = Some(Instant::now());

            if let Err(e) = self.send_control_frame(&ping).await {
                warn!("Failed to send ping: {}", e);
                break;
            }
        }
    }
}
