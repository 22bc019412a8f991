//! Connection supervisor
//!
//! Owns the listening socket and hands every accepted connection to its own
//! task. Session failures stay inside that task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use exbridge_common::{BridgeConfig, Result};
use exbridge_forwarder::StreamSink;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::session::{Session, SessionOptions};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct BridgeServer {
    config: BridgeConfig,
    sink: Arc<dyn StreamSink>,
    options: Arc<SessionOptions>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, sink: Arc<dyn StreamSink>) -> Result<Self> {
        config.validate()?;
        let options = Arc::new(SessionOptions::from_config(&config));
        Ok(Self {
            config,
            sink,
            options,
        })
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr.to_socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Bridge listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the process exits.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Sessions already running
    /// are left to finish on their own tasks.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let limiter = self.config.max_connections.map(|n| Arc::new(Semaphore::new(n)));
        tokio::pin!(shutdown);

        loop {
            let permit = match &limiter {
                Some(semaphore) => tokio::select! {
                    permit = semaphore.clone().acquire_owned() => Some(permit?),
                    _ = &mut shutdown => break,
                },
                None => None,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            self.dispatch(stream, peer, permit);
        }

        tracing::info!("Bridge stopped accepting connections");
        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, permit: Option<OwnedSemaphorePermit>) {
        let sink = self.sink.clone();
        let options = self.options.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(stream, peer, sink, options).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn StreamSink>,
    options: Arc<SessionOptions>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let mut session = Session::new(peer.to_string(), options);
    tracing::debug!("{} accepted from {}", session.id(), peer);

    match session.run(stream, sink.as_ref()).await {
        Ok(summary) => tracing::info!(
            "{} Successfully forwarded {} rows to '{}' in {} batches ({} bytes, {} nulls, {:?})",
            summary.session_id,
            summary.rows,
            summary.query_id,
            summary.batches,
            summary.payload_bytes,
            summary.null_values,
            summary.elapsed
        ),
        Err(e) => {
            let state = session
                .failed_in()
                .map(|s| s.to_string())
                .unwrap_or_default();
            if e.is_peer_disconnect() {
                tracing::warn!(
                    "{} [{}] client disconnected while {}: {}",
                    session.id(),
                    peer,
                    state,
                    e
                );
            } else {
                tracing::warn!("{} [{}] failed while {}: {}", session.id(), peer, state, e);
            }
        }
    }
}
