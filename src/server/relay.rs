//! QUIC endpoint and accept loop
//!
//! Builds the rustls/quinn server configuration, accepts connections, and
//! spawns a connection actor per client. Resource exhaustion is handled
//! here: past the session limit new connections are refused at the
//! transport level and existing sessions are untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::server::connection::ConnectionActor;
use crate::server::store::{RoomStore, StoreConfig, StoreHandle, StoreStats};

/// ALPN protocol identifier for the relay
const ALPN: &[u8] = b"murmur";

/// The relay server
pub struct RelayServer {
    config: Config,
    store: StoreHandle,
    endpoint: Option<Endpoint>,
    /// Connections currently being served
    active: Arc<AtomicUsize>,
}

impl RelayServer {
    /// Create a server and spawn its room store
    pub fn new(config: Config) -> Self {
        let store = RoomStore::spawn(StoreConfig::from(&config));
        Self {
            config,
            store,
            endpoint: None,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle to the room store
    pub fn store(&self) -> StoreHandle {
        self.store.clone()
    }

    /// Bind the endpoint and serve until the endpoint stops accepting
    pub async fn start(&mut self) -> Result<()> {
        info!("starting relay on {}", self.config.bind_addr);

        // Self-signed certificate; real deployments terminate TLS at the edge
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| RelayError::config(format!("failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| RelayError::config(format!("failed to serialize certificate: {}", e)))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| RelayError::config(format!("failed to configure TLS: {}", e)))?;
        server_config.alpn_protocols = vec![ALPN.to_vec()];

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.keep_alive_interval(Some(self.config.keepalive));
        transport_config.max_idle_timeout(Some(
            self.config
                .idle_timeout
                .try_into()
                .map_err(|_| RelayError::config("idle timeout out of range"))?,
        ));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
                .map_err(|e| RelayError::config(format!("failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(quic_server_config, self.config.bind_addr)
            .map_err(|e| RelayError::network(format!("failed to create endpoint: {}", e)))?;

        info!("relay listening on {}", endpoint.local_addr()?);
        self.endpoint = Some(endpoint.clone());

        self.accept_connections(endpoint).await
    }

    async fn accept_connections(&self, endpoint: Endpoint) -> Result<()> {
        loop {
            match endpoint.accept().await {
                Some(incoming) => {
                    if self.active.load(Ordering::Relaxed) >= self.config.max_sessions {
                        warn!("session limit reached, refusing connection");
                        incoming.refuse();
                        continue;
                    }

                    let store = self.store.clone();
                    let config = self.config.clone();
                    let active = Arc::clone(&self.active);
                    tokio::spawn(async move {
                        if let Err(e) = handle_incoming(incoming, store, config, active).await {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                None => {
                    warn!("endpoint stopped accepting connections");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Point-in-time store counters
    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Close the endpoint. In-flight writes to departing sessions may be
    /// dropped; room side effects have already been applied by the store.
    pub fn shutdown(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"server shutdown");
            info!("relay shutdown complete");
        }
    }
}

async fn handle_incoming(
    incoming: quinn::Incoming,
    store: StoreHandle,
    config: Config,
    active: Arc<AtomicUsize>,
) -> Result<()> {
    let connection = incoming.await?;

    // the SNI allow-list is the QUIC-side equivalent of the browser
    // deployment's Origin check
    let server_name = connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.server_name);
    if !config.origin_allowed(server_name.as_deref()) {
        warn!(remote = %connection.remote_address(), "origin not allowed, closing");
        connection.close(0u32.into(), b"origin not allowed");
        return Ok(());
    }

    active.fetch_add(1, Ordering::Relaxed);
    let result = ConnectionActor::new(connection, store, config.queue_depth)
        .run()
        .await;
    active.fetch_sub(1, Ordering::Relaxed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation() {
        let server = RelayServer::new(Config::default());
        assert!(server.endpoint.is_none());
        assert_eq!(server.active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_server_stats_start_empty() {
        let server = RelayServer::new(Config::default());
        let stats = server.stats().await.unwrap();
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.rooms, 0);
        assert_eq!(stats.waiting, 0);
    }
}
