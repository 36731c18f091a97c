//! Quinn-based QUIC transport.
//!
//! Terminates TLS 1.3 and hands accepted connections to the gateway. Each
//! client opens one bidirectional stream for its command frames; the server
//! opens one unidirectional stream back for everything it pushes (acks,
//! events, history pages). ALPN is pinned to `parlor/1`, so clients speaking
//! another protocol are rejected during the handshake.
//!
//! Certificates come from PEM files in production. Without them the
//! transport falls back to a self-signed certificate, which is only
//! suitable for local testing and logs a warning.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use parlor_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::server_error::ServerError;

/// QUIC-level idle limit, the backstop behind the gateway's read timeouts.
///
/// The gateway times out individual reads long before this fires. The
/// transport limit catches peers that vanish without closing, so half-open
/// connections are reaped even when no task is reading from them.
const TRANSPORT_IDLE_BACKSTOP: Duration = Duration::from_secs(120);

/// QUIC listener wrapping a Quinn endpoint.
///
/// Binding with `(None, None)` for the certificate paths generates a
/// self-signed certificate. That is fine for tests and local runs;
/// production deployments must provide certificates from a trusted CA or
/// every client will (correctly) refuse to connect.
pub struct QuinnTransport {
    /// Quinn endpoint
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Creates and binds a QUIC endpoint.
    ///
    /// Uses `cert_path`/`key_path` for TLS when both are present, otherwise
    /// falls back to a self-signed certificate.
    pub fn bind(
        address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(&cert, &key)?,
            _ => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!("QUIC transport bound to {}", addr);

        Ok(Self { endpoint })
    }

    /// Accepts the next QUIC connection, waiting until one arrives.
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| ServerError::Transport("endpoint closed".to_string()))?;

        let conn = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("connection failed: {e}")))?;

        Ok(QuinnConnection { connection: conn })
    }

    /// Local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }
}

/// An accepted QUIC connection.
///
/// Clones are cheap and share the underlying connection, so the gateway's
/// read loop and the outbound writer task can each hold one. All streams
/// are TLS-encrypted; the handshake completed before this value existed.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accepts the client's bidirectional command stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Opens the server-to-client push stream.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Closes the connection with an error code and reason.
    pub fn close(&self, error_code: quinn::VarInt, reason: &[u8]) {
        self.connection.close(error_code, reason);
    }
}

/// Loads TLS configuration from PEM certificate and key files.
fn load_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, ServerError> {
    use std::fs;

    let cert_pem = fs::read(cert_path)
        .map_err(|e| ServerError::Config(format!("failed to read cert '{cert_path}': {e}")))?;

    let key_pem = fs::read(key_path)
        .map_err(|e| ServerError::Config(format!("failed to read key '{key_path}': {e}")))?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    quic_server_config(tls_config)
}

/// Generates a throwaway self-signed certificate.
fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;

    let cert_chain = vec![cert.cert.der().clone()];
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;

    tracing::warn!("Using self-signed certificate - not for production use!");

    quic_server_config(tls_config)
}

/// Wraps a rustls config for Quinn, pinning ALPN and the idle backstop.
fn quic_server_config(mut tls_config: rustls::ServerConfig) -> Result<ServerConfig, ServerError> {
    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?,
    ));

    let backstop = quinn::IdleTimeout::try_from(TRANSPORT_IDLE_BACKSTOP)
        .map_err(|e| ServerError::Config(format!("idle timeout out of range: {e}")))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(backstop));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}
