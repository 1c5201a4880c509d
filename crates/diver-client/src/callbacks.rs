//! Callback listener
//!
//! The diver pushes a [`CallbackInvocationRequest`] to the endpoint given at
//! subscribe/hook time for every event or hook firing. The listener accepts
//! those connections on loopback and routes each push by token to a handler
//! closure or a channel.
//!
//! A firing can reach the listener before the `subscribe_event` /
//! `hook_method` response reaches the caller, so pushes for tokens without
//! a route are parked and handed over when the route is added.

use crate::error::{ClientError, Result};
use diver_common::ipc::{read_message, CallbackInvocationRequest};
use diver_common::{CallbackEndpoint, Token};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pushes parked for tokens that have no route yet
const MAX_PARKED: usize = 256;

/// Closure invoked for each push routed to it
pub type CallbackHandler = Arc<dyn Fn(CallbackInvocationRequest) + Send + Sync>;

#[derive(Clone)]
enum Route {
    Handler(CallbackHandler),
    Channel(mpsc::UnboundedSender<CallbackInvocationRequest>),
}

impl Route {
    fn deliver(&self, request: CallbackInvocationRequest) -> bool {
        match self {
            Route::Handler(handler) => {
                handler(request);
                true
            }
            Route::Channel(tx) => tx.send(request).is_ok(),
        }
    }
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<Token, Route>,
    parked: Vec<CallbackInvocationRequest>,
    retired: HashSet<Token>,
}

struct Shared {
    table: Mutex<RouteTable>,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn dispatch(&self, request: CallbackInvocationRequest) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let token = request.token;

        let route = {
            let mut table = self.table.lock();
            match table.routes.get(&token) {
                Some(route) => Some(route.clone()),
                None if table.retired.contains(&token) => None,
                None if table.parked.len() < MAX_PARKED => {
                    table.parked.push(request);
                    return;
                }
                None => None,
            }
        };

        // handlers run outside the table lock so they may add or remove routes
        let delivered = match route {
            Some(route) => route.deliver(request),
            None => false,
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(target: "diver_client::callbacks", %token, "Dropped callback without receiver");
        }
    }
}

/// Loopback endpoint receiving hook and event pushes
pub struct CallbackListener {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind to `addr` (e.g. `127.0.0.1:0`) and start accepting
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientError::Connection(format!("Failed to bind callback listener on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            table: Mutex::new(RouteTable::default()),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        info!(target: "diver_client::callbacks", address = %local_addr, "Callback listener started");

        Ok(Self {
            local_addr,
            shared,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint to hand to the diver
    pub fn endpoint(&self) -> CallbackEndpoint {
        CallbackEndpoint::new(self.local_addr.to_string())
    }

    /// Route pushes for `token` to `handler`
    pub fn route<F>(&self, token: Token, handler: F)
    where
        F: Fn(CallbackInvocationRequest) + Send + Sync + 'static,
    {
        self.add_route(token, Route::Handler(Arc::new(handler)));
    }

    /// Route pushes for `token` into a channel
    pub fn channel(&self, token: Token) -> mpsc::UnboundedReceiver<CallbackInvocationRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_route(token, Route::Channel(tx));
        rx
    }

    fn add_route(&self, token: Token, route: Route) {
        let parked = {
            let mut table = self.shared.table.lock();
            table.retired.remove(&token);
            table.routes.insert(token, route.clone());
            let (mine, rest): (Vec<_>, Vec<_>) =
                table.parked.drain(..).partition(|r| r.token == token);
            table.parked = rest;
            mine
        };
        if !parked.is_empty() {
            debug!(target: "diver_client::callbacks", %token, count = parked.len(), "Delivering parked callbacks");
        }
        for request in parked {
            route.deliver(request);
        }
    }

    /// Stop routing `token`; later pushes for it are dropped
    pub fn remove(&self, token: Token) -> bool {
        let mut table = self.shared.table.lock();
        table.parked.retain(|r| r.token != token);
        table.retired.insert(token);
        table.routes.remove(&token).is_some()
    }

    pub fn route_count(&self) -> usize {
        self.shared.table.lock().routes.len()
    }

    /// Pushes received since bind
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Pushes that found no live receiver
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(target: "diver_client::callbacks", peer = %addr, "Diver callback connection");
                stream.set_nodelay(true).ok();
                tokio::spawn(read_pushes(stream, addr, shared.clone()));
            }
            Err(e) => {
                warn!(target: "diver_client::callbacks", error = %e, "Callback accept failed");
            }
        }
    }
}

async fn read_pushes(mut stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    loop {
        match read_message::<_, CallbackInvocationRequest>(&mut stream).await {
            Ok(request) => shared.dispatch(request),
            Err(diver_common::Error::Transport(_)) => {
                debug!(target: "diver_client::callbacks", peer = %peer, "Callback connection closed");
                break;
            }
            Err(e) => {
                warn!(target: "diver_client::callbacks", peer = %peer, error = %e, "Invalid callback push");
                break;
            }
        }
    }
}
