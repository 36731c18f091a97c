//! Connection gateway
//!
//! One task per QUIC connection. The client opens a single bidirectional
//! stream and sends every frame on it, so per-session command order follows
//! from stream order; the server opens a single unidirectional stream and
//! drains the session's outbound queue into it through a writer task.
//!
//! The handshake and liveness rules live in the sans-IO
//! [`Connection`] state machine. Authenticated room traffic is decoded
//! here, wrapped into a [`CommandEnvelope`], and handed to the room workers
//! via the hub. Join, leave, send, and reaction toggles await the worker's
//! reply inline; everything else receives its reply through the outbound
//! queue.

use std::sync::Arc;

use bytes::BytesMut;
use parlor_core::connection::{Connection, ConnectionAction};
use parlor_core::{Environment, UserId};
use parlor_proto::payloads::moderation::ModerationKind;
use parlor_proto::payloads::presence::PresenceEvent;
use parlor_proto::payloads::session::Ack;
use parlor_proto::{ErrorPayload, Frame, FrameHeader, Opcode, Payload};
use quinn::{RecvStream, SendStream};
use tokio::sync::{mpsc, oneshot};

use crate::hub::RoomHub;
use crate::registry::SessionHandle;
use crate::router::{CommandContext, RoomCommand};
use crate::server_error::ServerError;
use crate::storage::Storage;
use crate::transport::QuinnConnection;
use crate::worker::{CommandEnvelope, queue_frame};
use crate::{Authenticator, ServerConfig, SharedState};

/// Runs one client connection to completion.
pub(crate) async fn handle_connection<E, A, S>(
    conn: QuinnConnection,
    hub: Arc<RoomHub<E, S>>,
    shared: Arc<SharedState>,
    auth: Arc<A>,
    env: E,
    config: ServerConfig,
) -> Result<(), ServerError>
where
    E: Environment,
    A: Authenticator,
    S: Storage,
{
    let session_id = env.random_u64();
    tracing::debug!(session_id, remote = %conn.remote_addr(), "connection accepted");

    // One server-opened uni stream carries every server-to-client frame in
    // queue order.
    let uni = conn.open_uni().await?;
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_channel_capacity);
    tokio::spawn(write_outbound(session_id, uni, outbound_rx));

    let mut connection = Connection::new(env.now(), config.connection);
    connection.set_session_id(session_id);

    // The client must open its command stream within the handshake window.
    let handshake_timeout = config.connection.handshake_timeout;
    let (send, mut recv) = match tokio::time::timeout(handshake_timeout, conn.accept_bi()).await {
        Ok(streams) => streams?,
        Err(_) => {
            tracing::debug!(session_id, "no command stream before handshake timeout");
            conn.close(quinn::VarInt::from_u32(2), b"handshake timeout");
            return Ok(());
        }
    };
    drop(send);

    let mut gateway = Gateway {
        session_id,
        username: None,
        connection,
        hub,
        shared,
        auth,
        env,
        config,
        outbound: outbound_tx,
    };

    gateway.read_loop(&mut recv).await;
    gateway.teardown(&conn).await;
    Ok(())
}

/// Per-connection state the read loop operates on.
struct Gateway<E: Environment, A, S> {
    session_id: u64,
    /// Display name resolved at authentication.
    username: Option<String>,
    connection: Connection<E::Instant>,
    hub: Arc<RoomHub<E, S>>,
    shared: Arc<SharedState>,
    auth: Arc<A>,
    env: E,
    config: ServerConfig,
    outbound: mpsc::Sender<Frame>,
}

impl<E, A, S> Gateway<E, A, S>
where
    E: Environment,
    A: Authenticator,
    S: Storage,
{
    async fn read_loop(&mut self, recv: &mut RecvStream) {
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            // Pre-auth the handshake window applies, afterwards the idle
            // window; every received frame restarts it.
            let window = if self.connection.is_authenticated() {
                self.config.connection.idle_timeout
            } else {
                self.config.connection.handshake_timeout
            };

            let frame = match tokio::time::timeout(window, read_frame(recv, &mut buf)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err @ ServerError::Protocol(_))) => {
                    tracing::warn!(session_id = self.session_id, error = %err, "malformed stream");
                    break;
                }
                Ok(Err(err)) => {
                    tracing::debug!(session_id = self.session_id, error = %err, "stream ended");
                    break;
                }
                Err(_) => {
                    // The state machine owns the timeout verdict.
                    let actions = self.connection.tick(self.env.now());
                    self.flush_frames(actions).await;
                    break;
                }
            };

            if !self.process_frame(&frame).await {
                break;
            }
        }
    }

    /// Applies one frame. Returns false when the connection must close.
    async fn process_frame(&mut self, frame: &Frame) -> bool {
        match frame.header.opcode_enum() {
            // Lifecycle frames (and unknown opcodes) go through the
            // connection state machine.
            Some(Opcode::Hello | Opcode::Ping | Opcode::Goodbye) | None => {
                self.drive_connection(frame).await
            }
            Some(_) => {
                if !self.connection.is_authenticated() {
                    self.reply_error(
                        frame,
                        ErrorPayload::auth_failed("authenticate before room operations"),
                    )
                    .await;
                    return false;
                }
                self.connection.update_activity(self.env.now());
                self.route_room_frame(frame).await
            }
        }
    }

    async fn drive_connection(&mut self, frame: &Frame) -> bool {
        let actions = match self.connection.handle_frame(frame, self.env.now()) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::debug!(session_id = self.session_id, error = %err, "protocol violation");
                return false;
            }
        };

        let mut open = true;
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => self.queue_stamped(frame).await,
                ConnectionAction::Authenticate { token, client_info } => {
                    open &= self.authenticate(&token, client_info.as_deref()).await;
                }
                ConnectionAction::Close { reason } => {
                    tracing::debug!(session_id = self.session_id, reason, "connection closing");
                    open = false;
                }
            }
        }
        open
    }

    /// Verifies the Hello credential and brings the session online.
    async fn authenticate(&mut self, token: &str, client_info: Option<&str>) -> bool {
        let user_id = match self.auth.verify(token) {
            Ok(user_id) => user_id,
            Err(err) => {
                tracing::info!(
                    session_id = self.session_id,
                    error = %err,
                    "authentication rejected"
                );
                match self.connection.reject_auth(&err.to_string()) {
                    Ok(actions) => {
                        self.flush_frames(actions).await;
                    }
                    Err(state_err) => {
                        tracing::error!(
                            session_id = self.session_id,
                            error = %state_err,
                            "reject_auth failed"
                        );
                    }
                }
                return false;
            }
        };

        let username = self.shared.directory.username(user_id);
        let handle = SessionHandle {
            user_id,
            username: username.clone(),
            outbound: self.outbound.clone(),
        };
        if !self.shared.registry.write().await.register(self.session_id, handle) {
            // 64-bit random session ids collide only under a broken RNG.
            tracing::error!(session_id = self.session_id, "session id collision");
            return false;
        }
        self.username = username;

        match self.connection.accept_auth(user_id, self.env.now()) {
            Ok(actions) => {
                tracing::info!(
                    session_id = self.session_id,
                    user_id,
                    client_info = client_info.unwrap_or("unknown"),
                    "session authenticated"
                );
                self.flush_frames(actions).await;
                let now_ms = self.env.wall_clock_ms();
                let event = self.shared.presence.lock().await.connect(user_id, now_ms);
                if let Some(event) = event {
                    self.fan_out_presence(event).await;
                }
                true
            }
            Err(err) => {
                tracing::error!(session_id = self.session_id, error = %err, "accept_auth failed");
                false
            }
        }
    }

    /// Decodes an authenticated frame and routes it to the room layer.
    ///
    /// Room rejections are replies, not connection faults, so this always
    /// leaves the connection open.
    async fn route_room_frame(&mut self, frame: &Frame) -> bool {
        let Some(user_id) = self.connection.user_id() else {
            return false;
        };

        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(
                    session_id = self.session_id,
                    error = %err,
                    "undecodable payload"
                );
                self.reply_error(frame, ErrorPayload::malformed(format!("payload: {err}"))).await;
                return true;
            }
        };

        let ctx = CommandContext {
            sender: user_id,
            username: self.username.clone(),
            request_id: frame.header.request_id(),
        };

        match payload {
            Payload::CreateRoom(create) => {
                let result = self.hub.create_room(
                    frame.header.room_id(),
                    create.kind,
                    create.capacity,
                    create.private,
                    user_id,
                );
                match result {
                    Ok(()) => self.reply_ack(frame).await,
                    Err(err) => self.reply_error(frame, err.to_error_payload()).await,
                }
            }
            Payload::ChangeStatus(change) => {
                let now_ms = self.env.wall_clock_ms();
                let event =
                    self.shared.presence.lock().await.set_status(user_id, change.status, now_ms);
                self.reply_ack(frame).await;
                if let Some(event) = event {
                    self.fan_out_presence(event).await;
                }
            }
            Payload::DirectMessage(message) => {
                let target = frame.header.target_id();
                let command = RoomCommand::Send {
                    content: message.content,
                    kind: message.kind,
                    reply_to: None,
                };
                self.dispatch_direct(user_id, target, frame, ctx, command, true).await;
            }
            Payload::TypingDm(typing) => {
                let target = frame.header.target_id();
                let command = RoomCommand::Typing { active: typing.active };
                self.dispatch_direct(user_id, target, frame, ctx, command, false).await;
            }
            Payload::JoinRoom => self.dispatch(frame, ctx, RoomCommand::Join, true).await,
            Payload::LeaveRoom => self.dispatch(frame, ctx, RoomCommand::Leave, true).await,
            Payload::RoomMessage(message) => {
                let command = RoomCommand::Send {
                    content: message.content,
                    kind: message.kind,
                    reply_to: message.reply_to,
                };
                self.dispatch(frame, ctx, command, true).await;
            }
            Payload::ToggleReaction(toggle) => {
                let command = RoomCommand::ToggleReaction {
                    message_id: toggle.message_id,
                    emoji: toggle.emoji,
                };
                self.dispatch(frame, ctx, command, true).await;
            }
            Payload::HistoryRequest(request) => {
                let command = RoomCommand::History {
                    before_sequence: request.before_sequence,
                    limit: request.limit,
                };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::Typing(typing) => {
                let command = RoomCommand::Typing { active: typing.active };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::MarkRead(mark) => {
                let command = RoomCommand::MarkRead { message_id: mark.message_id };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::ReadList(list) => {
                let command = RoomCommand::ReadList { message_id: list.message_id };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::Invite(invite) => {
                let command = RoomCommand::Invite { user_id: invite.user_id };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::Moderate(moderate) => {
                let command = RoomCommand::Moderate {
                    kind: moderate.kind,
                    target_user: moderate.target_user,
                    target_message: moderate.target_message,
                    reason: moderate.reason,
                    duration_ms: moderate.duration_ms,
                };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::DeleteMessage(delete) => {
                // Shorthand for a delete moderation action; same gate, same
                // audit trail.
                let command = RoomCommand::Moderate {
                    kind: ModerationKind::DeleteMessage,
                    target_user: None,
                    target_message: Some(delete.message_id),
                    reason: String::new(),
                    duration_ms: None,
                };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::ChangeRole(change) => {
                let command =
                    RoomCommand::ChangeRole { user_id: change.user_id, role: change.role };
                self.dispatch(frame, ctx, command, false).await;
            }
            Payload::ModerationLog(log) => {
                let command = RoomCommand::ModerationLog { limit: log.limit };
                self.dispatch(frame, ctx, command, false).await;
            }
            other => {
                tracing::debug!(
                    session_id = self.session_id,
                    opcode = ?other.opcode(),
                    "client sent a server-only opcode"
                );
                self.reply_error(
                    frame,
                    ErrorPayload::malformed(format!(
                        "opcode {:#06x} is not client-initiated",
                        frame.header.opcode()
                    )),
                )
                .await;
            }
        }
        true
    }

    /// Hands a command to the room named in the frame header.
    ///
    /// With `awaited`, the worker's reply comes back through a oneshot and
    /// is forwarded before the next frame is read; otherwise the reply
    /// rides the outbound queue like any event.
    async fn dispatch(
        &self,
        frame: &Frame,
        ctx: CommandContext,
        command: RoomCommand,
        awaited: bool,
    ) {
        let room_id = frame.header.room_id();
        let (reply, reply_rx) = if awaited {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let envelope = CommandEnvelope {
            context: ctx,
            session_id: Some(self.session_id),
            command,
            reply,
        };

        if let Err(err) = self.hub.dispatch(room_id, envelope).await {
            self.reply_error(frame, err.to_error_payload()).await;
            return;
        }
        if let Some(reply_rx) = reply_rx {
            self.forward_reply(frame, reply_rx).await;
        }
    }

    /// Like [`Gateway::dispatch`], but the room is the direct conversation
    /// between the sender and the frame's target id.
    async fn dispatch_direct(
        &self,
        user_id: UserId,
        target: UserId,
        frame: &Frame,
        ctx: CommandContext,
        command: RoomCommand,
        awaited: bool,
    ) {
        let (reply, reply_rx) = if awaited {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let envelope = CommandEnvelope {
            context: ctx,
            session_id: Some(self.session_id),
            command,
            reply,
        };

        if let Err(err) = self.hub.dispatch_direct(user_id, target, envelope).await {
            self.reply_error(frame, err.to_error_payload()).await;
            return;
        }
        if let Some(reply_rx) = reply_rx {
            self.forward_reply(frame, reply_rx).await;
        }
    }

    async fn forward_reply(&self, frame: &Frame, reply_rx: oneshot::Receiver<Frame>) {
        match reply_rx.await {
            Ok(reply) => self.forward_frame(reply).await,
            Err(_) => {
                self.reply_error(
                    frame,
                    ErrorPayload::protocol("room worker dropped the reply"),
                )
                .await;
            }
        }
    }

    /// Delivers a presence transition to everyone sharing a room with the
    /// subject, plus the subject's own sessions.
    async fn fan_out_presence(&self, event: PresenceEvent) {
        let mut header = FrameHeader::new(Opcode::PresenceEvent);
        header.set_sender_id(event.user_id);
        header.set_timestamp_ms(self.env.wall_clock_ms());
        let frame = match Payload::PresenceEvent(event).into_frame(header) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode presence event");
                return;
            }
        };

        let peers = self.shared.membership.read().await.peers_of(event.user_id);

        let registry = self.shared.registry.read().await;
        for user in peers.into_iter().chain(std::iter::once(event.user_id)) {
            for session_id in registry.sessions_of(user) {
                if let Some(outbound) = registry.outbound(session_id) {
                    queue_frame(&outbound, session_id, frame.clone());
                }
            }
        }
    }

    /// Queues the SendFrame actions; reports whether the connection stays
    /// open. Used for action lists that cannot carry an Authenticate.
    async fn flush_frames(&mut self, actions: Vec<ConnectionAction>) -> bool {
        let mut open = true;
        for action in actions {
            match action {
                ConnectionAction::SendFrame(frame) => self.queue_stamped(frame).await,
                ConnectionAction::Close { reason } => {
                    tracing::debug!(session_id = self.session_id, reason, "connection closing");
                    open = false;
                }
                ConnectionAction::Authenticate { .. } => {
                    tracing::error!(
                        session_id = self.session_id,
                        "authenticate action outside the hello path"
                    );
                    open = false;
                }
            }
        }
        open
    }

    async fn reply_ack(&self, request: &Frame) {
        let mut header = FrameHeader::new(Opcode::Ack);
        header.set_room_id(request.header.room_id());
        header.set_request_id(request.header.request_id());
        match Payload::Ack(Ack::empty()).into_frame(header) {
            Ok(frame) => self.queue_stamped(frame).await,
            Err(err) => {
                tracing::error!(session_id = self.session_id, error = %err, "failed to encode ack");
            }
        }
    }

    async fn reply_error(&self, request: &Frame, payload: ErrorPayload) {
        let mut header = FrameHeader::new(Opcode::Error);
        header.set_room_id(request.header.room_id());
        header.set_request_id(request.header.request_id());
        match Payload::Error(payload).into_frame(header) {
            Ok(frame) => self.queue_stamped(frame).await,
            Err(err) => {
                tracing::error!(
                    session_id = self.session_id,
                    error = %err,
                    "failed to encode error reply"
                );
            }
        }
    }

    /// Stamps and queues a gateway-originated frame. Worker frames arrive
    /// already stamped and go through [`Gateway::forward_frame`].
    async fn queue_stamped(&self, mut frame: Frame) {
        frame.header.set_timestamp_ms(self.env.wall_clock_ms());
        self.forward_frame(frame).await;
    }

    async fn forward_frame(&self, frame: Frame) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!(session_id = self.session_id, "outbound writer gone");
        }
    }

    /// Releases every per-session registration and closes the transport.
    async fn teardown(mut self, conn: &QuinnConnection) {
        let removed = self.shared.registry.write().await.unregister(self.session_id);

        if let Some((handle, was_last)) = removed {
            // The tracker refcounts connects, so every teardown reports its
            // disconnect; the Offline event fires on the last one only.
            let now_ms = self.env.wall_clock_ms();
            let offline = self.shared.presence.lock().await.disconnect(handle.user_id, now_ms);
            if let Some(event) = offline {
                self.fan_out_presence(event).await;
            }

            if was_last {
                // Memberships follow the user, not the session; only the
                // last session's departure vacates the rooms.
                let rooms = self.shared.membership.read().await.rooms_of(handle.user_id);
                for room_id in rooms {
                    let envelope = CommandEnvelope {
                        context: CommandContext {
                            sender: handle.user_id,
                            username: handle.username.clone(),
                            request_id: 0,
                        },
                        session_id: None,
                        command: RoomCommand::ImplicitLeave,
                        reply: None,
                    };
                    if let Err(err) = self.hub.dispatch(room_id, envelope).await {
                        tracing::warn!(
                            session_id = self.session_id,
                            room_id = %room_id,
                            error = %err,
                            "implicit leave not delivered"
                        );
                    }
                }
            }
        }

        self.connection.close();
        conn.close(quinn::VarInt::from_u32(0), b"session closed");
        tracing::debug!(session_id = self.session_id, "connection closed");
    }
}

/// Drains one session's outbound queue into its uni stream.
///
/// Ends when the queue's last sender drops or the stream errors; the
/// gateway notices the disconnect separately through its read loop.
async fn write_outbound(session_id: u64, mut stream: SendStream, mut outbound: mpsc::Receiver<Frame>) {
    let mut buf = BytesMut::with_capacity(4096);
    while let Some(frame) = outbound.recv().await {
        buf.clear();
        if let Err(err) = frame.encode(&mut buf) {
            tracing::error!(session_id, error = %err, "failed to encode outbound frame");
            continue;
        }
        if let Err(err) = stream.write_all(&buf).await {
            tracing::debug!(session_id, error = %err, "outbound stream closed");
            break;
        }
    }
    let _ = stream.finish();
}

/// Reads exactly one frame: a fixed-size header, then the payload it
/// announces. The header parse enforces the payload size cap before any
/// allocation.
async fn read_frame(recv: &mut RecvStream, buf: &mut BytesMut) -> Result<Frame, ServerError> {
    buf.clear();
    buf.resize(FrameHeader::SIZE, 0);
    recv.read_exact(&mut buf[..FrameHeader::SIZE])
        .await
        .map_err(|err| ServerError::Transport(format!("header read: {err}")))?;

    let header = *FrameHeader::from_bytes(&buf[..FrameHeader::SIZE])
        .map_err(|err| ServerError::Protocol(format!("frame header: {err}")))?;

    let payload_size = header.payload_size() as usize;
    if payload_size > 0 {
        buf.resize(FrameHeader::SIZE + payload_size, 0);
        recv.read_exact(&mut buf[FrameHeader::SIZE..])
            .await
            .map_err(|err| ServerError::Transport(format!("payload read: {err}")))?;
    }

    Frame::decode(&buf[..]).map_err(|err| ServerError::Protocol(format!("frame decode: {err}")))
}
