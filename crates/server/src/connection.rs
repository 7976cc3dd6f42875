//! Client sockets.
//!
//! Each connection gets a task that frames messages, relays them to the
//! server actor and writes whatever the actor queues for it. The task owns
//! the transport, so it is also the one that performs the TLS upgrade.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use scribble_protocol::{Message, MessageCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ConnId, Outbound};
use crate::session_server::{ServerCommand, ServerHandle};

/// Anything a connection can run over, before or after the TLS upgrade
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Load a certificate chain and private key from PEM files
pub fn load_tls(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("open certificate {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("parse certificate chain")?;

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open private key {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("parse private key")?
        .context("no private key found")?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("select TLS versions")?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("build TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept connections until `shutdown` fires, then give the open ones
/// `drain_timeout` to flush their last frames.
pub async fn serve(
    listener: TcpListener,
    server: ServerHandle,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(
            component = "connection",
            event = "listener.started",
            %addr,
            tls = tls.is_some(),
            "Listening for clients"
        );
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!(
                        component = "connection",
                        event = "connection.task_failed",
                        error = %e,
                        "Connection task ended abnormally"
                    );
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(
                            component = "connection",
                            event = "listener.accept_failed",
                            error = %e,
                            "Accept failed"
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(component = "connection", error = %e, "Could not set TCP_NODELAY");
                }
                connections.spawn(handle_connection(stream, peer, server.clone(), tls.clone()));
            }
        }
    }

    drop(listener);
    drain_connections(connections, drain_timeout).await;
}

/// Wait for connection tasks to finish, aborting whatever is left after `timeout`
async fn drain_connections(mut connections: JoinSet<()>, timeout: Duration) {
    let open = connections.len();
    let drained = tokio::time::timeout(timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    match drained {
        Ok(()) => debug!(
            component = "connection",
            event = "listener.drained",
            connections = open,
            "All connections closed"
        ),
        Err(_) => {
            warn!(
                component = "connection",
                event = "listener.drain_timeout",
                remaining = connections.len(),
                "Connections still open at shutdown, aborting them"
            );
            connections.shutdown().await;
        }
    }
}

/// Run one client connection to completion
pub async fn handle_connection<S>(
    io: S,
    peer: SocketAddr,
    server: ServerHandle,
    tls: Option<TlsAcceptor>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id: ConnId = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    debug!(
        component = "connection",
        event = "connection.opened",
        connection_id = conn_id,
        %peer,
        "Client connected"
    );
    server
        .send(ServerCommand::ClientConnected {
            conn_id,
            peer,
            outbound: outbound_tx,
        })
        .await;

    let io: Box<dyn Transport> = Box::new(io);
    let mut framed = Framed::new(io, MessageCodec);

    loop {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(msg)) => server.send(ServerCommand::ClientMessage { conn_id, msg }).await,
                Some(Err(e)) => {
                    server
                        .send(ServerCommand::BadData { conn_id, error: e.to_string() })
                        .await;
                    break;
                }
                None => break,
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Message(msg)) => {
                    if let Err(e) = framed.send(msg).await {
                        debug!(
                            component = "connection",
                            event = "connection.write_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Write failed"
                        );
                        break;
                    }
                }
                Some(Outbound::Disconnect { reason, message }) => {
                    if let Err(e) = framed.send(Message::disconnect(reason, &message)).await {
                        debug!(
                            component = "connection",
                            event = "connection.write_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Could not write disconnect notice"
                        );
                    }
                    break;
                }
                Some(Outbound::StartTls) => {
                    let Some(acceptor) = tls.clone() else {
                        break;
                    };
                    // The startTls reply was queued first and has already
                    // been flushed in the clear
                    let parts = framed.into_parts();
                    if !parts.read_buf.is_empty() {
                        warn!(
                            component = "connection",
                            event = "connection.tls_failed",
                            connection_id = conn_id,
                            "Client sent plaintext data after startTls"
                        );
                        break;
                    }
                    match acceptor.accept(parts.io).await {
                        Ok(stream) => {
                            let io: Box<dyn Transport> = Box::new(stream);
                            framed = Framed::new(io, MessageCodec);
                            server.send(ServerCommand::TlsEstablished { conn_id }).await;
                        }
                        Err(e) => {
                            warn!(
                                component = "connection",
                                event = "connection.tls_failed",
                                connection_id = conn_id,
                                error = %e,
                                "TLS handshake failed"
                            );
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }

    if !server.is_closed() {
        server.send(ServerCommand::ClientDisconnected { conn_id }).await;
    }
    debug!(
        component = "connection",
        event = "connection.closed",
        connection_id = conn_id,
        "Client disconnected"
    );
}
