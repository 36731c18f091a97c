//! Server-side connection lifecycle (sans-IO).
//!
//! [`Connection`] tracks a single client connection from accept to close.
//! It never touches the network: the driver feeds it decoded frames and
//! clock readings, and executes the [`ConnectionAction`]s it returns.
//!
//! Authentication is asynchronous from the machine's point of view. A
//! `Hello` produces [`ConnectionAction::Authenticate`]; the driver verifies
//! the token against its authenticator and reports the verdict through
//! [`Connection::accept_auth`] or [`Connection::reject_auth`].

use std::time::Duration;
use std::time::Instant;

use parlor_proto::payloads::session::{Goodbye, Welcome};
use parlor_proto::{ErrorPayload, Frame, FrameHeader, Opcode, Payload};

use crate::error::ConnectionError;

/// Default time allowed to complete the Hello/Welcome handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle timeout for authenticated connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default heartbeat interval advertised to clients in `Welcome`.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, nothing received yet.
    Init,
    /// Hello received, authentication verdict outstanding.
    Pending,
    /// Handshake complete, session traffic allowed.
    Authenticated,
    /// Connection closed, no further actions will be produced.
    Closed,
}

/// Timeout configuration for a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Maximum time from accept to authentication.
    pub handshake_timeout: Duration,
    /// Maximum time between frames once authenticated.
    pub idle_timeout: Duration,
    /// Ping interval advertised to the client. The idle timeout should be
    /// a small multiple of this.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Actions the driver must execute on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Send a frame to the peer.
    SendFrame(Frame),
    /// Verify the presented credential with the authenticator, then call
    /// `accept_auth` or `reject_auth` with the outcome.
    Authenticate {
        /// Opaque credential token from the Hello payload.
        token: String,
        /// Client build identifier, for logging.
        client_info: Option<String>,
    },
    /// Close the underlying transport.
    Close {
        /// Reason for closing, suitable for logs.
        reason: String,
    },
}

/// Sans-IO state machine for one client connection.
///
/// Generic over instant type `I` so tests can drive it with a synthetic
/// clock. Production uses the `std::time::Instant` default.
///
/// # Invariants
///
/// - State only moves forward: Init -> Pending -> Authenticated -> Closed
/// - `user_id` is `Some` exactly in the Authenticated and later states
/// - A Closed connection produces no further actions
#[derive(Debug)]
pub struct Connection<I = Instant> {
    state: ConnectionState,
    config: ConnectionConfig,
    created_at: I,
    last_activity: I,
    session_id: Option<u64>,
    user_id: Option<u64>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Creates a connection in the Init state.
    pub fn new(now: I, config: ConnectionConfig) -> Self {
        Self {
            state: ConnectionState::Init,
            config,
            created_at: now,
            last_activity: now,
            session_id: None,
            user_id: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Server-assigned session id, once assigned.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Authenticated user id, once the handshake completed.
    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    /// Whether session traffic (room commands) is allowed.
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    /// Assigns the session id for this connection.
    ///
    /// Must happen before `accept_auth`; the driver assigns ids at accept
    /// time so log lines can reference the session from the first byte.
    pub fn set_session_id(&mut self, session_id: u64) {
        debug_assert!(self.session_id.is_none(), "session id assigned twice");
        self.session_id = Some(session_id);
    }

    /// Records peer activity, deferring the idle timeout.
    pub fn update_activity(&mut self, now: I) {
        debug_assert!(now >= self.last_activity, "clock went backwards");
        self.last_activity = now;
    }

    /// Moves the connection to Closed without emitting actions.
    ///
    /// Used when the transport is already gone and there is nothing left
    /// to send.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Returns the elapsed time if the connection has exceeded its current
    /// timeout, or `None` if it is still within bounds.
    ///
    /// Connections that have not completed the handshake are bounded by
    /// `handshake_timeout` from accept; authenticated connections by
    /// `idle_timeout` from the last received frame.
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        match self.state {
            ConnectionState::Init | ConnectionState::Pending => {
                let elapsed = now - self.created_at;
                (elapsed >= self.config.handshake_timeout).then_some(elapsed)
            }
            ConnectionState::Authenticated => {
                let elapsed = now - self.last_activity;
                (elapsed >= self.config.idle_timeout).then_some(elapsed)
            }
            ConnectionState::Closed => None,
        }
    }

    /// Periodic timer driven by the server.
    ///
    /// Checks timeouts and closes the connection when one fires. Returns
    /// the actions to execute (possibly none).
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        let Some(elapsed) = self.check_timeout(now) else {
            return Vec::new();
        };

        let error = match self.state {
            ConnectionState::Init | ConnectionState::Pending => {
                ConnectionError::HandshakeTimeout { elapsed }
            }
            _ => ConnectionError::IdleTimeout { elapsed },
        };
        self.state = ConnectionState::Closed;
        vec![ConnectionAction::Close { reason: error.to_string() }]
    }

    /// Processes a session-level frame (Hello, Ping, Goodbye).
    ///
    /// Room and presence opcodes never reach this method; the driver routes
    /// them to the room layer after checking `is_authenticated`.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame is not valid for the current state.
    /// The driver should close the connection on any error.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let opcode = frame.header.opcode_enum().ok_or(ConnectionError::UnexpectedFrame {
            state: self.state,
            opcode: frame.header.opcode(),
        })?;

        self.update_activity(now);

        match (self.state, opcode) {
            (ConnectionState::Init, Opcode::Hello) => self.handle_hello(frame),
            (state, Opcode::Goodbye) if state != ConnectionState::Closed => {
                self.handle_goodbye(frame)
            }
            (ConnectionState::Authenticated, Opcode::Ping) => {
                let pong = Payload::Pong.into_frame(FrameHeader::new(Opcode::Pong))?;
                Ok(vec![ConnectionAction::SendFrame(pong)])
            }
            (state, opcode) => {
                Err(ConnectionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            }
        }
    }

    /// Completes the handshake after the authenticator accepted the token.
    ///
    /// Binds the connection to `user_id` and emits the `Welcome` frame.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the connection is Pending, and
    /// `Protocol` if no session id was assigned before the verdict.
    pub fn accept_auth(
        &mut self,
        user_id: u64,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Pending {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "accept authentication".to_string(),
            });
        }
        let Some(session_id) = self.session_id else {
            return Err(ConnectionError::Protocol(
                "no session id assigned before welcome".to_string(),
            ));
        };

        self.user_id = Some(user_id);
        self.state = ConnectionState::Authenticated;
        self.update_activity(now);

        let welcome = Welcome {
            user_id,
            session_id,
            heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
        };
        let frame = Payload::Welcome(welcome).into_frame(FrameHeader::new(Opcode::Welcome))?;
        Ok(vec![ConnectionAction::SendFrame(frame)])
    }

    /// Fails the handshake after the authenticator rejected the token.
    ///
    /// Emits an `Error` frame with code `AUTH_FAILED` followed by a close.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the connection is Pending.
    pub fn reject_auth(&mut self, reason: &str) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state != ConnectionState::Pending {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "reject authentication".to_string(),
            });
        }

        self.state = ConnectionState::Closed;
        let frame = Payload::Error(ErrorPayload::auth_failed(reason))
            .into_frame(FrameHeader::new(Opcode::Error))?;
        Ok(vec![
            ConnectionAction::SendFrame(frame),
            ConnectionAction::Close { reason: format!("authentication failed: {reason}") },
        ])
    }

    fn handle_hello(&mut self, frame: &Frame) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let payload = Payload::from_frame(frame).map_err(|_| ConnectionError::InvalidPayload {
            expected: "Hello",
            opcode: frame.header.opcode(),
        })?;
        let Payload::Hello(hello) = payload else {
            return Err(ConnectionError::InvalidPayload {
                expected: "Hello",
                opcode: frame.header.opcode(),
            });
        };

        if hello.token.is_empty() {
            return Err(ConnectionError::Protocol("empty credential token".to_string()));
        }

        self.state = ConnectionState::Pending;
        Ok(vec![ConnectionAction::Authenticate {
            token: hello.token,
            client_info: hello.client_info,
        }])
    }

    fn handle_goodbye(&mut self, frame: &Frame) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let payload = Payload::from_frame(frame).map_err(|_| ConnectionError::InvalidPayload {
            expected: "Goodbye",
            opcode: frame.header.opcode(),
        })?;
        let Payload::Goodbye(goodbye) = payload else {
            return Err(ConnectionError::InvalidPayload {
                expected: "Goodbye",
                opcode: frame.header.opcode(),
            });
        };

        self.state = ConnectionState::Closed;
        let reason = goodbye.reason.unwrap_or_else(|| "client requested close".to_string());
        let ack = Payload::Goodbye(Goodbye { reason: None })
            .into_frame(FrameHeader::new(Opcode::Goodbye))?;
        Ok(vec![
            ConnectionAction::SendFrame(ack),
            ConnectionAction::Close { reason: format!("peer goodbye: {reason}") },
        ])
    }
}

#[cfg(test)]
mod tests {
    use parlor_proto::payloads::session::Hello;

    use super::*;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    fn hello_frame(token: &str) -> Frame {
        Payload::Hello(Hello {
            token: token.to_string(),
            client_info: Some("test-client/0.1".to_string()),
        })
        .into_frame(FrameHeader::new(Opcode::Hello))
        .unwrap()
    }

    fn goodbye_frame(reason: Option<&str>) -> Frame {
        Payload::Goodbye(Goodbye { reason: reason.map(str::to_string) })
            .into_frame(FrameHeader::new(Opcode::Goodbye))
            .unwrap()
    }

    fn authenticated_connection(t0: Instant) -> Connection {
        let mut conn = Connection::new(t0, test_config());
        conn.set_session_id(77);
        conn.handle_frame(&hello_frame("tok"), t0).unwrap();
        conn.accept_auth(42, t0).unwrap();
        conn
    }

    #[test]
    fn new_connection_starts_in_init() {
        let conn: Connection = Connection::new(Instant::now(), test_config());
        assert_eq!(conn.state(), ConnectionState::Init);
        assert!(conn.session_id().is_none());
        assert!(conn.user_id().is_none());
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn hello_requests_authentication() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());

        let actions = conn.handle_frame(&hello_frame("tok-abc"), t0).unwrap();

        assert_eq!(conn.state(), ConnectionState::Pending);
        assert_eq!(actions.len(), 1);
        let ConnectionAction::Authenticate { token, client_info } = &actions[0] else {
            panic!("expected Authenticate action, got {actions:?}");
        };
        assert_eq!(token, "tok-abc");
        assert_eq!(client_info.as_deref(), Some("test-client/0.1"));
    }

    #[test]
    fn hello_with_empty_token_is_rejected() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());

        let err = conn.handle_frame(&hello_frame(""), t0).unwrap_err();

        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[test]
    fn hello_with_garbage_payload_is_invalid() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        let frame = Frame::new(FrameHeader::new(Opcode::Hello), vec![0xff, 0x00, 0xff]);

        let err = conn.handle_frame(&frame, t0).unwrap_err();

        assert!(matches!(err, ConnectionError::InvalidPayload { expected: "Hello", .. }));
    }

    #[test]
    fn accept_auth_sends_welcome() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        conn.set_session_id(901);
        conn.handle_frame(&hello_frame("tok"), t0).unwrap();

        let actions = conn.accept_auth(42, t0).unwrap();

        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.user_id(), Some(42));
        assert_eq!(actions.len(), 1);
        let ConnectionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected SendFrame, got {actions:?}");
        };
        let Payload::Welcome(welcome) = Payload::from_frame(frame).unwrap() else {
            panic!("expected Welcome payload");
        };
        assert_eq!(welcome.user_id, 42);
        assert_eq!(welcome.session_id, 901);
        assert_eq!(welcome.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn accept_auth_requires_session_id() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        conn.handle_frame(&hello_frame("tok"), t0).unwrap();

        let err = conn.accept_auth(42, t0).unwrap_err();

        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[test]
    fn accept_auth_requires_pending_state() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, test_config());
        conn.set_session_id(1);

        let err = conn.accept_auth(42, t0).unwrap_err();

        assert!(matches!(err, ConnectionError::InvalidState { .. }));
    }

    #[test]
    fn reject_auth_sends_error_and_closes() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        conn.set_session_id(1);
        conn.handle_frame(&hello_frame("bad-token"), t0).unwrap();

        let actions = conn.reject_auth("token expired").unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 2);
        let ConnectionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected SendFrame, got {actions:?}");
        };
        let Payload::Error(error) = Payload::from_frame(frame).unwrap() else {
            panic!("expected Error payload");
        };
        assert_eq!(error.code, ErrorPayload::AUTH_FAILED);
        assert!(matches!(&actions[1], ConnectionAction::Close { .. }));
    }

    #[test]
    fn second_hello_is_unexpected() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);

        let err = conn.handle_frame(&hello_frame("again"), t0).unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::UnexpectedFrame { state: ConnectionState::Authenticated, .. }
        ));
    }

    #[test]
    fn hello_while_pending_is_unexpected() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        conn.handle_frame(&hello_frame("tok"), t0).unwrap();

        let err = conn.handle_frame(&hello_frame("tok"), t0).unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::UnexpectedFrame { state: ConnectionState::Pending, .. }
        ));
    }

    #[test]
    fn ping_gets_pong_when_authenticated() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);
        let ping = Payload::Ping.into_frame(FrameHeader::new(Opcode::Ping)).unwrap();

        let actions = conn.handle_frame(&ping, t0 + Duration::from_secs(5)).unwrap();

        assert_eq!(actions.len(), 1);
        let ConnectionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected SendFrame, got {actions:?}");
        };
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Pong));
    }

    #[test]
    fn ping_before_authentication_is_unexpected() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, test_config());
        let ping = Payload::Ping.into_frame(FrameHeader::new(Opcode::Ping)).unwrap();

        let err = conn.handle_frame(&ping, t0).unwrap_err();

        assert!(matches!(err, ConnectionError::UnexpectedFrame { .. }));
    }

    #[test]
    fn goodbye_acks_and_closes() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);

        let actions = conn.handle_frame(&goodbye_frame(Some("logging off")), t0).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 2);
        let ConnectionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected SendFrame ack, got {actions:?}");
        };
        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Goodbye));
        let ConnectionAction::Close { reason } = &actions[1] else {
            panic!("expected Close, got {actions:?}");
        };
        assert!(reason.contains("logging off"));
    }

    #[test]
    fn goodbye_before_authentication_closes() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, test_config());

        let actions = conn.handle_frame(&goodbye_frame(None), t0).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn handshake_timeout_fires_in_init() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, test_config());

        assert!(conn.tick(t0 + Duration::from_secs(9)).is_empty());
        let actions = conn.tick(t0 + Duration::from_secs(10));

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 1);
        let ConnectionAction::Close { reason } = &actions[0] else {
            panic!("expected Close, got {actions:?}");
        };
        assert!(reason.contains("handshake timeout"));
    }

    #[test]
    fn handshake_timeout_fires_while_pending() {
        let t0 = Instant::now();
        let mut conn = Connection::new(t0, test_config());
        conn.handle_frame(&hello_frame("tok"), t0 + Duration::from_secs(2)).unwrap();

        let actions = conn.tick(t0 + Duration::from_secs(10));

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn idle_timeout_fires_when_authenticated() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);

        assert!(conn.tick(t0 + Duration::from_secs(29)).is_empty());
        let actions = conn.tick(t0 + Duration::from_secs(30));

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(actions.len(), 1);
        let ConnectionAction::Close { reason } = &actions[0] else {
            panic!("expected Close, got {actions:?}");
        };
        assert!(reason.contains("idle timeout"));
    }

    #[test]
    fn activity_defers_idle_timeout() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);

        conn.update_activity(t0 + Duration::from_secs(25));

        assert!(conn.tick(t0 + Duration::from_secs(40)).is_empty());
        assert_eq!(conn.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn closed_connection_never_times_out() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(t0, test_config());
        conn.close();

        assert!(conn.check_timeout(t0 + Duration::from_secs(3600)).is_none());
        assert!(conn.tick(t0 + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn room_opcode_is_not_handled_here() {
        let t0 = Instant::now();
        let mut conn = authenticated_connection(t0);
        let frame = Frame::new(FrameHeader::new(Opcode::JoinRoom), Vec::new());

        let err = conn.handle_frame(&frame, t0).unwrap_err();

        assert!(matches!(err, ConnectionError::UnexpectedFrame { .. }));
    }
}
