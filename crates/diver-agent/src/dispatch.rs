//! Callback dispatch
//!
//! Hook and event call sites run on target threads and must never block, so
//! they only `try_send` into a bounded queue. A dedicated thread drains the
//! queue and performs the network send.
//!
//! Each token owns a state cell. The dispatcher holds the cell's read guard
//! across the state check and the send; cancelling a token takes the write
//! guard, so once [`TokenTable::cancel`] returns no send for that token can
//! start. Call sites only ever try the read guard: a cancel waiting on a slow
//! send must not hold up the target thread.

use diver_common::ipc::{write_message_blocking, CallbackInvocationRequest};
use diver_common::{CallbackEndpoint, Error, ProcessId, Result, Token, TokenState};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Tokens
// =============================================================================

/// State shared between a registration, its call sites and the dispatcher
pub struct TokenCell {
    token: Token,
    owner: ProcessId,
    endpoint: CallbackEndpoint,
    state: RwLock<TokenState>,
}

impl TokenCell {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn endpoint(&self) -> &CallbackEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> TokenState {
        *self.state.read()
    }

    /// Read guard that is held while acting on behalf of the token. Blocks
    /// while a cancel is in progress; only the dispatcher may wait on it.
    pub fn guard(&self) -> RwLockReadGuard<'_, TokenState> {
        self.state.read()
    }

    /// Non-blocking guard for call sites on target threads.
    ///
    /// `None` unless the token is active and no cancel is pending or running.
    pub fn try_active(&self) -> Option<RwLockReadGuard<'_, TokenState>> {
        self.state
            .try_read()
            .filter(|state| **state == TokenState::Active)
    }

    fn transition(&self, next: TokenState) -> bool {
        let mut state = self.state.write();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Issues tokens and tracks their cells. Token values are never reused.
pub struct TokenTable {
    next: AtomicU64,
    cells: RwLock<HashMap<Token, Arc<TokenCell>>>,
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// New token in the `Registered` state
    pub fn issue(&self, owner: ProcessId, endpoint: CallbackEndpoint) -> Arc<TokenCell> {
        let token = Token(self.next.fetch_add(1, Ordering::SeqCst));
        let cell = Arc::new(TokenCell {
            token,
            owner,
            endpoint,
            state: RwLock::new(TokenState::Registered),
        });
        self.cells.write().insert(token, Arc::clone(&cell));
        trace!(target: "diver_agent::dispatch", %token, owner, "Token issued");
        cell
    }

    pub fn activate(&self, token: Token) -> bool {
        self.get(token)
            .map(|cell| cell.transition(TokenState::Active))
            .unwrap_or(false)
    }

    /// Move the token to `Unregistered`, waiting out any in-flight send
    pub fn cancel(&self, token: Token) -> bool {
        let cell = self.cells.write().remove(&token);
        match cell {
            Some(cell) => {
                cell.transition(TokenState::Unregistered);
                trace!(target: "diver_agent::dispatch", %token, "Token cancelled");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, token: Token) -> Option<Arc<TokenCell>> {
        self.cells.read().get(&token).cloned()
    }

    /// Number of live (not yet cancelled) tokens
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Sends one push to a controller's callback endpoint
pub trait CallbackTransport: Send + Sync + 'static {
    fn deliver(&self, endpoint: &CallbackEndpoint, request: &CallbackInvocationRequest)
        -> Result<()>;
}

/// First pause after an endpoint fails
pub const DEFAULT_ENDPOINT_BACKOFF: Duration = Duration::from_millis(500);

/// Longest pause for an endpoint that keeps failing
pub const MAX_ENDPOINT_BACKOFF: Duration = Duration::from_secs(30);

/// Failing endpoint: pushes for it are dropped until `retry_at`
struct Backoff {
    delay: Duration,
    retry_at: Instant,
}

/// Framed TCP delivery with one cached connection per endpoint.
///
/// An endpoint that fails to connect or accept a write is backed off with
/// doubling delays, so one dead controller does not hold up pushes to the
/// others.
pub struct TcpCallbackTransport {
    timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    connections: Mutex<HashMap<CallbackEndpoint, TcpStream>>,
    backoffs: Mutex<HashMap<CallbackEndpoint, Backoff>>,
}

impl TcpCallbackTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_backoff: DEFAULT_ENDPOINT_BACKOFF,
            max_backoff: MAX_ENDPOINT_BACKOFF,
            connections: Mutex::new(HashMap::new()),
            backoffs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Remaining pause for an endpoint, if it is backed off
    fn backing_off(&self, endpoint: &CallbackEndpoint) -> Option<Duration> {
        let backoffs = self.backoffs.lock();
        let backoff = backoffs.get(endpoint)?;
        let now = Instant::now();
        (backoff.retry_at > now).then(|| backoff.retry_at - now)
    }

    fn record_failure(&self, endpoint: &CallbackEndpoint) {
        let mut backoffs = self.backoffs.lock();
        let delay = match backoffs.get(endpoint) {
            Some(previous) => (previous.delay * 2).min(self.max_backoff),
            None => self.initial_backoff,
        };
        backoffs.insert(
            endpoint.clone(),
            Backoff {
                delay,
                retry_at: Instant::now() + delay,
            },
        );
        warn!(
            target: "diver_agent::dispatch",
            %endpoint,
            backoff_ms = delay.as_millis() as u64,
            "Callback endpoint failing, backing off"
        );
    }

    fn record_success(&self, endpoint: &CallbackEndpoint) {
        if self.backoffs.lock().remove(endpoint).is_some() {
            info!(target: "diver_agent::dispatch", %endpoint, "Callback endpoint recovered");
        }
    }

    fn connect(&self, endpoint: &CallbackEndpoint) -> Result<TcpStream> {
        let addr = endpoint.socket_addr()?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", endpoint, e)))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| Error::Transport(e.to_string()))?;
        stream.set_nodelay(true).ok();
        debug!(target: "diver_agent::dispatch", %endpoint, "Callback connection opened");
        Ok(stream)
    }
}

impl CallbackTransport for TcpCallbackTransport {
    fn deliver(
        &self,
        endpoint: &CallbackEndpoint,
        request: &CallbackInvocationRequest,
    ) -> Result<()> {
        if let Some(remaining) = self.backing_off(endpoint) {
            return Err(Error::Transport(format!(
                "{} is backed off for another {}ms",
                endpoint,
                remaining.as_millis()
            )));
        }

        // only the dispatcher thread delivers, so holding the map lock is uncontended
        let mut connections = self.connections.lock();
        if !connections.contains_key(endpoint) {
            match self.connect(endpoint) {
                Ok(stream) => {
                    connections.insert(endpoint.clone(), stream);
                }
                Err(e) => {
                    self.record_failure(endpoint);
                    return Err(e);
                }
            }
        }
        let Some(stream) = connections.get_mut(endpoint) else {
            return Err(Error::Internal("Callback connection missing".to_string()));
        };
        let result = write_message_blocking(stream, request);
        match &result {
            Ok(()) => self.record_success(endpoint),
            Err(_) => {
                connections.remove(endpoint);
                self.record_failure(endpoint);
            }
        }
        result
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct QueuedCallback {
    cell: Arc<TokenCell>,
    request: CallbackInvocationRequest,
}

/// Bounded queue plus background sender
pub struct CallbackDispatcher {
    sender: RwLock<Option<mpsc::Sender<QueuedCallback>>>,
    capacity: usize,
    dropped: AtomicU64,
    delivered: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackDispatcher {
    /// Start the dispatcher thread
    pub fn start(capacity: usize, transport: Arc<dyn CallbackTransport>) -> Result<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&delivered);

        let worker = std::thread::Builder::new()
            .name("diver-callbacks".to_string())
            .spawn(move || run_dispatcher(rx, transport, counter))
            .map_err(|e| Error::Internal(format!("Failed to start dispatcher: {}", e)))?;

        info!(target: "diver_agent::dispatch", capacity, "Callback dispatcher started");
        Ok(Self {
            sender: RwLock::new(Some(tx)),
            capacity,
            dropped: AtomicU64::new(0),
            delivered,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a push without blocking. Returns false if it was dropped.
    pub fn enqueue(&self, cell: &Arc<TokenCell>, request: CallbackInvocationRequest) -> bool {
        let sender = self.sender.read();
        let Some(tx) = sender.as_ref() else {
            return false;
        };
        let item = QueuedCallback {
            cell: Arc::clone(cell),
            request,
        };
        match tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "diver_agent::dispatch",
                    token = %item.cell.token(),
                    dropped,
                    "Callback queue full, dropping push"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Items waiting to be sent
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map(|tx| self.capacity.saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Close the queue, let the thread send what is already queued, then join it
    pub fn shutdown(&self) {
        self.sender.write().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(target: "diver_agent::dispatch", "Dispatcher thread panicked");
            }
            info!(target: "diver_agent::dispatch", "Callback dispatcher stopped");
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_dispatcher(
    mut rx: mpsc::Receiver<QueuedCallback>,
    transport: Arc<dyn CallbackTransport>,
    delivered: Arc<AtomicU64>,
) {
    while let Some(item) = rx.blocking_recv() {
        let state = item.cell.guard();
        if *state != TokenState::Active {
            trace!(
                target: "diver_agent::dispatch",
                token = %item.cell.token(),
                "Skipping push for inactive token"
            );
            continue;
        }
        match transport.deliver(item.cell.endpoint(), &item.request) {
            Ok(()) => {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(
                target: "diver_agent::dispatch",
                token = %item.cell.token(),
                endpoint = %item.cell.endpoint(),
                error = %e,
                "Callback delivery failed"
            ),
        }
        drop(state);
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use diver_common::ipc::CallbackContext;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    /// Records every delivery; optionally sleeps inside the send
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<(CallbackEndpoint, CallbackInvocationRequest)>>,
        pub delay: Mutex<Option<Duration>>,
        pub in_send: AtomicBool,
    }

    impl RecordingTransport {
        pub fn tokens(&self) -> Vec<Token> {
            self.sent.lock().iter().map(|(_, r)| r.token).collect()
        }
    }

    impl CallbackTransport for RecordingTransport {
        fn deliver(
            &self,
            endpoint: &CallbackEndpoint,
            request: &CallbackInvocationRequest,
        ) -> Result<()> {
            self.in_send.store(true, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            self.sent.lock().push((endpoint.clone(), request.clone()));
            self.in_send.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn push(token: Token) -> CallbackInvocationRequest {
        CallbackInvocationRequest {
            timestamp: now_millis(),
            token,
            args: vec![],
            context: CallbackContext::Event {
                event_name: "Fired".to_string(),
            },
        }
    }

    fn endpoint() -> CallbackEndpoint {
        CallbackEndpoint::new("127.0.0.1:1")
    }

    #[test]
    fn test_tokens_are_unique_and_never_reused() {
        let table = TokenTable::new();
        let a = table.issue(1, endpoint()).token();
        table.cancel(a);
        let b = table.issue(1, endpoint()).token();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_token_lifecycle() {
        let table = TokenTable::new();
        let cell = table.issue(1, endpoint());
        assert_eq!(cell.state(), TokenState::Registered);
        assert!(table.activate(cell.token()));
        assert_eq!(cell.state(), TokenState::Active);
        assert!(table.cancel(cell.token()));
        assert_eq!(cell.state(), TokenState::Unregistered);
        assert!(!table.activate(cell.token()));
        assert!(!table.cancel(cell.token()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_delivers_active_tokens_only() {
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = CallbackDispatcher::start(16, transport.clone()).unwrap();
        let table = TokenTable::new();

        let active = table.issue(1, endpoint());
        table.activate(active.token());
        let registered = table.issue(1, endpoint());

        assert!(dispatcher.enqueue(&registered, push(registered.token())));
        assert!(dispatcher.enqueue(&active, push(active.token())));
        assert!(wait_until(|| dispatcher.delivered() == 1));
        dispatcher.shutdown();
        assert_eq!(transport.tokens(), vec![active.token()]);
    }

    #[test]
    fn test_no_send_starts_after_cancel_returns() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.delay.lock() = Some(Duration::from_millis(50));
        let dispatcher = CallbackDispatcher::start(64, transport.clone()).unwrap();
        let table = TokenTable::new();
        let cell = table.issue(7, endpoint());
        table.activate(cell.token());

        for _ in 0..10 {
            dispatcher.enqueue(&cell, push(cell.token()));
        }
        assert!(wait_until(|| transport.in_send.load(Ordering::SeqCst)));

        // waits for the send in progress
        table.cancel(cell.token());
        assert!(!transport.in_send.load(Ordering::SeqCst));
        let sent_at_cancel = transport.sent.lock().len();

        dispatcher.shutdown();
        assert_eq!(transport.sent.lock().len(), sent_at_cancel);
        assert!(sent_at_cancel < 10);
    }

    #[test]
    fn test_call_site_not_held_up_by_pending_cancel() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.delay.lock() = Some(Duration::from_millis(800));
        let dispatcher = CallbackDispatcher::start(4, transport.clone()).unwrap();
        let table = Arc::new(TokenTable::new());
        let cell = table.issue(3, endpoint());
        table.activate(cell.token());
        assert!(cell.try_active().is_some());

        dispatcher.enqueue(&cell, push(cell.token()));
        assert!(wait_until(|| transport.in_send.load(Ordering::SeqCst)));

        let canceller = {
            let table = Arc::clone(&table);
            let token = cell.token();
            std::thread::spawn(move || table.cancel(token))
        };
        // let the cancel queue up behind the send
        std::thread::sleep(Duration::from_millis(100));
        assert!(transport.in_send.load(Ordering::SeqCst));

        let started = Instant::now();
        assert!(cell.try_active().is_none());
        assert!(started.elapsed() < Duration::from_millis(20));

        assert!(canceller.join().unwrap());
        assert_eq!(cell.state(), TokenState::Unregistered);
        assert!(cell.try_active().is_none());
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.delay.lock() = Some(Duration::from_millis(200));
        let dispatcher = CallbackDispatcher::start(1, transport.clone()).unwrap();
        let table = TokenTable::new();
        let cell = table.issue(1, endpoint());
        table.activate(cell.token());

        let accepted = (0..20)
            .filter(|_| dispatcher.enqueue(&cell, push(cell.token())))
            .count();
        assert!(accepted < 20);
        assert_eq!(dispatcher.dropped(), (20 - accepted) as u64);
    }

    #[test]
    fn test_tcp_transport_reports_unreachable_endpoint() {
        let transport = TcpCallbackTransport::new(Duration::from_millis(200));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = transport.deliver(&CallbackEndpoint::new(addr.to_string()), &push(Token(1)));
        assert!(result.is_err());
    }

    #[test]
    fn test_tcp_transport_backs_off_failing_endpoint() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dead = CallbackEndpoint::new(addr.to_string());
        let transport = TcpCallbackTransport::new(Duration::from_millis(200))
            .with_backoff(Duration::from_millis(300), Duration::from_secs(1));

        assert!(transport.deliver(&dead, &push(Token(1))).is_err());

        // the endpoint comes back, but it stays backed off until the delay passes
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let started = Instant::now();
        let err = transport.deliver(&dead, &push(Token(2))).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(err.to_string().contains("backed off"));
        assert!(listener.accept().is_err());

        std::thread::sleep(Duration::from_millis(350));
        transport.deliver(&dead, &push(Token(3))).unwrap();
        assert!(transport.backing_off(&dead).is_none());
    }

    #[test]
    fn test_tcp_transport_frames_push() {
        use std::io::Read;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpCallbackTransport::new(Duration::from_secs(1));
        transport
            .deliver(&CallbackEndpoint::new(addr.to_string()), &push(Token(3)))
            .unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut len = [0u8; 4];
        conn.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        conn.read_exact(&mut body).unwrap();
        let got: CallbackInvocationRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(got.token, Token(3));
    }
}
