//! Parlor production server.
//!
//! Runtime glue around [`parlor_core`]'s deterministic state machines:
//! Quinn for QUIC transport, Tokio for the async runtime, system time and
//! cryptographic randomness via [`SystemEnv`].
//!
//! # Architecture
//!
//! Every accepted connection gets one gateway task that owns the client's
//! bidirectional stream and a writer task draining the session's outbound
//! queue into a server-opened unidirectional stream. Room commands are
//! enveloped and handed to per-room worker tasks through the [`RoomHub`];
//! each worker owns its room's [`RoomRouter`] exclusively, which is what
//! makes message ordering within a room total without locks.
//!
//! [`RoomHub`]: hub::RoomHub
//!
//! # Components
//!
//! - [`RoomRouter`]: per-room command logic (pure, virtual-time testable)
//! - [`Server`]: accept loop wiring gateways, workers, and storage together
//! - [`QuinnTransport`]: QUIC endpoint via Quinn
//! - [`Storage`]: message log and room definitions (in-memory or redb)
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

mod auth;
mod directory;
mod gateway;
mod hub;
mod registry;
mod router;
mod server_error;
pub mod storage;
mod system_env;
mod transport;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub use auth::{AuthError, Authenticator, Credential, StaticTokens, parse_credentials};
pub use directory::{Directory, MemoryDirectory};
use hub::RoomHub;
use parlor_core::connection::ConnectionConfig;
use parlor_core::presence::PresenceTracker;
pub use registry::{MembershipIndex, SessionHandle, SessionRegistry};
pub use router::{
    CommandContext, FanoutScope, HISTORY_PAGE_LIMIT, MAX_EMOJI_BYTES, MAX_MESSAGE_CONTENT_BYTES,
    RoomAction, RoomCommand, RoomRouter,
};
pub use server_error::ServerError;
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageError, StoredMessage};
pub use system_env::SystemEnv;
use tokio::sync::{Mutex, RwLock};
pub use transport::{QuinnConnection, QuinnTransport};

/// State shared by every gateway and worker task.
pub(crate) struct SharedState {
    /// Live authenticated sessions and their outbound queues.
    pub(crate) registry: RwLock<SessionRegistry>,
    /// Which rooms each user currently occupies, for presence fan-out and
    /// disconnect cleanup.
    pub(crate) membership: RwLock<MembershipIndex>,
    /// Cross-device presence aggregation.
    pub(crate) presence: Mutex<PresenceTracker>,
    /// User id to display name resolution.
    pub(crate) directory: Arc<dyn Directory>,
}

impl SharedState {
    pub(crate) fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            registry: RwLock::new(SessionRegistry::new()),
            membership: RwLock::new(MembershipIndex::new()),
            presence: Mutex::new(PresenceTracker::new()),
            directory,
        }
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433").
    pub bind_address: String,
    /// Path to TLS certificate (PEM format). Self-signed when absent.
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format).
    pub key_path: Option<String>,
    /// Handshake, idle, and heartbeat timing for each connection.
    pub connection: ConnectionConfig,
    /// Command inbox depth per room worker. A full inbox rejects with
    /// `overloaded` instead of queueing unboundedly.
    pub worker_channel_capacity: usize,
    /// Outbound frame queue depth per session. A full queue drops event
    /// frames for that session.
    pub outbound_channel_capacity: usize,
    /// Cadence of room housekeeping (typing expiry, restriction purges).
    pub tick_interval: Duration,
    /// Maximum concurrent connections. Further handshakes are refused.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            connection: ConnectionConfig::default(),
            worker_channel_capacity: 64,
            outbound_channel_capacity: 256,
            tick_interval: Duration::from_secs(1),
            max_connections: 10_000,
        }
    }
}

/// Production Parlor server.
///
/// Generic over the token verifier and the storage backend; the binary
/// picks [`StaticTokens`] plus [`MemoryStorage`] or [`RedbStorage`] from
/// its flags.
pub struct Server<A: Authenticator, S: Storage> {
    transport: QuinnTransport,
    hub: Arc<RoomHub<SystemEnv, S>>,
    shared: Arc<SharedState>,
    auth: Arc<A>,
    env: SystemEnv,
    config: ServerConfig,
}

impl<A: Authenticator, S: Storage> Server<A, S> {
    /// Creates and binds a new server.
    ///
    /// Room definitions already present in `storage` become joinable
    /// immediately; their workers spawn lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unusable address or TLS material, and
    /// `Storage` when the startup inventory scan fails.
    pub fn bind(
        config: ServerConfig,
        auth: A,
        storage: S,
        directory: Arc<dyn Directory>,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();

        let known_rooms = storage.list_rooms()?.len();
        tracing::info!(known_rooms, "storage attached");

        let shared = Arc::new(SharedState::new(directory));
        let hub = Arc::new(RoomHub::new(
            Arc::clone(&shared),
            storage,
            env.clone(),
            config.worker_channel_capacity,
            config.tick_interval,
        ));

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.clone(),
            config.key_path.clone(),
        )?;

        Ok(Self {
            transport,
            hub,
            shared,
            auth: Arc::new(auth),
            env,
            config,
        })
    }

    /// Runs the accept loop, spawning one gateway task per connection.
    ///
    /// Runs until the process is stopped or the endpoint closes.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the endpoint itself fails; per-connection
    /// errors are logged and do not stop the loop.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(address = %self.transport.local_addr()?, "server listening");

        let active = Arc::new(AtomicUsize::new(0));

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    if active.load(Ordering::Acquire) >= self.config.max_connections {
                        tracing::warn!(
                            remote = %conn.remote_addr(),
                            "connection limit reached, refusing"
                        );
                        conn.close(quinn::VarInt::from_u32(1), b"server full");
                        continue;
                    }
                    active.fetch_add(1, Ordering::AcqRel);

                    let hub = Arc::clone(&self.hub);
                    let shared = Arc::clone(&self.shared);
                    let auth = Arc::clone(&self.auth);
                    let env = self.env.clone();
                    let config = self.config.clone();
                    let active = Arc::clone(&active);

                    tokio::spawn(async move {
                        if let Err(err) =
                            gateway::handle_connection(conn, hub, shared, auth, env, config).await
                        {
                            tracing::debug!(error = %err, "connection ended with error");
                        }
                        active.fetch_sub(1, Ordering::AcqRel);
                    });
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                }
            }
        }
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the endpoint cannot report its address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}
