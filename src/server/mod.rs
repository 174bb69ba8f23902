//! Device-facing TCP server.
//!
//! Accepts connections, runs the handshake on each, promotes survivors to
//! [`DeviceSession`]s, and publishes device lifecycle events on the bus.

pub mod handshake;
pub mod session;

pub use handshake::{handshake, HandshakeConfig, HandshakeOutcome};
pub use session::{DeviceSession, MessageParams, SessionEvent};

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::ServerKey;
use crate::error::Result;
use crate::events::{EventPublisher, PublishMetadata, PublishedEvent};
use crate::keystore::KeyStore;
use crate::types::DeviceId;

/// Lifecycle event published when a device comes online or drops.
pub const STATUS_EVENT: &str = "spark/status";

/// The device-cloud server.
pub struct DeviceServer {
    config: Config,
    server_key: Arc<ServerKey>,
    keystore: Arc<KeyStore>,
    publisher: EventPublisher,
    sessions: Arc<DashMap<DeviceId, Arc<DeviceSession>>>,
    shutdown: broadcast::Sender<()>,
}

impl DeviceServer {
    pub fn new(
        config: Config,
        server_key: ServerKey,
        keystore: KeyStore,
        publisher: EventPublisher,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            server_key: Arc::new(server_key),
            keystore: Arc::new(keystore),
            publisher,
            sessions: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Accept and serve device connections until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.server.listen_addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "device server listening");

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = accepted?;
                    let _ = stream.set_nodelay(true);
                    self.attach(stream, remote_addr);
                }
                _ = shutdown_rx.recv() => {
                    info!("device server shutting down");
                    break;
                }
            }
        }

        for entry in self.sessions.iter() {
            entry.value().close("server shutdown");
        }
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Look up the live session for a device.
    pub fn session(&self, device_id: &DeviceId) -> Option<Arc<DeviceSession>> {
        self.sessions.get(device_id).map(|s| Arc::clone(&s))
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve one already-accepted connection on its own task.
    ///
    /// `run` calls this for every accepted socket; it is public so embedders
    /// can hand the server connections from their own listeners.
    pub fn attach<S>(&self, stream: S, remote_addr: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let server_key = Arc::clone(&self.server_key);
        let keystore = Arc::clone(&self.keystore);
        let publisher = self.publisher.clone();
        let sessions = Arc::clone(&self.sessions);
        let session_config = self.config.session.clone();

        tokio::spawn(async move {
            let handshake_config = HandshakeConfig::default();
            let outcome =
                match handshake(stream, &server_key, &keystore, &handshake_config).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Dropping the socket closes it; firmware reconnects.
                        warn!(remote = %remote_addr, error = %e, "handshake failed");
                        return;
                    }
                };

            let device_id = outcome.device_id;
            let session = DeviceSession::spawn(outcome, &session_config);
            // Subscribe before anything can close the session, so the
            // disconnect event cannot slip past.
            let events = session.events();
            let connection_key = session.connection_key();
            info!(device_id = %device_id, connection = %connection_key, remote = %remote_addr, "device online");

            if let Some(previous) = sessions.insert(device_id, Arc::clone(&session)) {
                previous.close("superseded by new connection");
            }

            publisher.publish(
                PublishedEvent::new(STATUS_EVENT)
                    .with_device_id(device_id)
                    .with_connection_id(connection_key)
                    .with_payload(&b"online"[..]),
                PublishMetadata::INTERNAL,
            );

            // Hold the task until the session dies, then tidy up.
            let cause = await_disconnect(&session, events).await;
            sessions.remove_if(&device_id, |_, live| Arc::ptr_eq(live, &session));
            info!(device_id = %device_id, connection = %connection_key, remote = %remote_addr, cause = %cause, "device offline");

            publisher.publish(
                PublishedEvent::new(STATUS_EVENT)
                    .with_device_id(device_id)
                    .with_connection_id(connection_key)
                    .with_payload(&b"offline"[..]),
                PublishMetadata::INTERNAL,
            );
        });
    }
}

async fn await_disconnect(
    session: &DeviceSession,
    mut events: broadcast::Receiver<SessionEvent>,
) -> String {
    // The subscription predates any possible close, except a close that
    // finished before it was created.
    if !session.is_open() {
        return "closed during setup".into();
    }
    loop {
        match events.recv().await {
            Ok(SessionEvent::Disconnect { cause }) => return cause,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return "session dropped".into(),
        }
    }
}
