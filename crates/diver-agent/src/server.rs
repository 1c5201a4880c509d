//! TCP front end of the diver
//!
//! One task per connection; requests on a connection are handled in order,
//! each on a blocking worker bounded by the request timeout. After `die`
//! the listener stops accepting, in-flight requests get a grace period and
//! then every session is torn down.

use crate::diver::Diver;
use crate::session::ConnectionId;
use diver_common::ipc::{decode_request, read_frame, write_message, RequestEnvelope, ResponseEnvelope};
use diver_common::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct DiverServer {
    diver: Arc<Diver>,
    listener: TcpListener,
    connections: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    next_connection: AtomicU64,
}

impl DiverServer {
    /// Bind the listener described by the diver's config
    pub async fn bind(diver: Arc<Diver>) -> Result<Self> {
        let addr = diver.config().listen_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!(target: "diver_agent::server", address = %addr, error = %e, "Failed to bind");
            Error::Transport(format!("Failed to bind {}: {}", addr, e))
        })?;
        Ok(Self {
            diver,
            listener,
            connections: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))
    }

    pub fn diver(&self) -> &Arc<Diver> {
        &self.diver
    }

    /// Serve until `die`, then drain and shut the diver down
    pub async fn run(self) -> Result<()> {
        let config = self.diver.config().clone();
        let mut shutdown = self.diver.shutdown_signal();
        info!(
            target: "diver_agent::server",
            address = %self.local_addr()?,
            max_clients = config.max_clients,
            "Diver listening"
        );

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer, config.max_clients),
                    Err(e) => {
                        error!(target: "diver_agent::server", error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        let DiverServer {
            diver,
            listener,
            in_flight,
            ..
        } = self;
        drop(listener);
        info!(target: "diver_agent::server", "Stopped accepting connections");

        let deadline = Instant::now() + config.shutdown_grace();
        while in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let abandoned = in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!(target: "diver_agent::server", abandoned, "Grace period over with requests in flight");
        }

        let teardown = Arc::clone(&diver);
        if let Err(e) = tokio::task::spawn_blocking(move || teardown.shutdown()).await {
            error!(target: "diver_agent::server", error = %e, "Shutdown task failed");
        }
        info!(target: "diver_agent::server", "Diver stopped");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr, max_clients: usize) {
        if self.connections.load(Ordering::SeqCst) >= max_clients {
            warn!(target: "diver_agent::server", peer = %peer, max_clients, "Client limit reached, closing connection");
            return;
        }
        let connection = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        self.connections.fetch_add(1, Ordering::SeqCst);
        info!(target: "diver_agent::server", peer = %peer, %connection, "New client connection");

        let diver = Arc::clone(&self.diver);
        let connections = Arc::clone(&self.connections);
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let shutdown = diver.shutdown_signal();
            if let Err(e) =
                handle_connection(stream, connection, Arc::clone(&diver), in_flight, shutdown).await
            {
                debug!(target: "diver_agent::server", %connection, error = %e, "Connection ended with error");
            }
            connections.fetch_sub(1, Ordering::SeqCst);

            let closed = Arc::clone(&diver);
            match tokio::task::spawn_blocking(move || closed.connection_closed(connection)).await {
                Ok(0) => {}
                Ok(torn_down) => {
                    info!(target: "diver_agent::server", %connection, torn_down, "Tore down sessions of closed connection")
                }
                Err(e) => error!(target: "diver_agent::server", %connection, error = %e, "Teardown task failed"),
            }
            info!(target: "diver_agent::server", %connection, "Client disconnected");
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    connection: ConnectionId,
    diver: Arc<Diver>,
    in_flight: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();
    let timeout = diver.config().request_timeout();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let body = match frame {
            Ok(body) => body,
            Err(e @ Error::Protocol(_)) => {
                // the oversized body is still on the wire; the stream cannot be resynchronized
                warn!(target: "diver_agent::server", %connection, error = %e, "Rejecting frame");
                write_message(&mut writer, &ResponseEnvelope::from_error(0, &e)).await?;
                return Err(e);
            }
            Err(_) => break,
        };

        let response = match decode_request(&body) {
            Ok(request) => {
                in_flight.fetch_add(1, Ordering::SeqCst);
                let response = run_handler(Arc::clone(&diver), connection, request, timeout).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                response
            }
            Err((id, e)) => {
                debug!(target: "diver_agent::server", %connection, id, error = %e, "Undecodable request");
                ResponseEnvelope::from_error(id, &e)
            }
        };
        write_message(&mut writer, &response).await?;
    }
    Ok(())
}

/// Run one request on a blocking worker. A panic or timeout becomes an
/// `Internal` error response.
async fn run_handler(
    diver: Arc<Diver>,
    connection: ConnectionId,
    request: RequestEnvelope,
    timeout: Duration,
) -> ResponseEnvelope {
    let id = request.id;
    let command = request.body.name();
    let task = tokio::task::spawn_blocking(move || diver.handle(Some(connection), request));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(target: "diver_agent::server", id, command, error = %e, "Handler task failed");
            ResponseEnvelope::from_error(id, &Error::Internal(format!("Handler task failed: {}", e)))
        }
        Err(_) => {
            warn!(target: "diver_agent::server", id, command, "Handler timed out");
            ResponseEnvelope::from_error(id, &Error::Internal("Request timed out".to_string()))
        }
    }
}
