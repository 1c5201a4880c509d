//! Client handle
//!
//! One [`DiverClient`] owns one diver session: it connects, registers its
//! pid, and unregisters on [`DiverClient::close`]. Connection management
//! mirrors the rest of the tooling: exponential backoff on connect, a
//! per-request timeout, and an optional heartbeat that tracks
//! [`ConnectionHealth`].

use crate::callbacks::CallbackListener;
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ClientError, Result};
use crate::proxy::RemoteObject;
use diver_common::ipc::{
    read_message, write_message, CallbackInvocationRequest, Command, CreateObjectRequest,
    DieRequest, DiverStatus, DumpTypeRequest, GetFieldRequest, GetItemRequest, HookMethodRequest,
    InvocationRequest, InvocationResult, ListTypesRequest, PinObjectRequest,
    QueryCollectionRequest, QueryCollectionResponse, RegisterRequest, ReleaseObjectRequest,
    RequestEnvelope, ResponseEnvelope, SearchHeapRequest, SearchHeapResponse, SetFieldRequest,
    SubscribeEventRequest, TokenRequest, TokenResponse, TraceContext, UnregisterRequest,
    UnregisterResponse, PONG,
};
use diver_common::{
    CallbackEndpoint, CollectionQuery, HookPosition, ObjectAddress, ObjectOrPrimitive, ProcessId,
    RemoteHandle, Token, TypeDump,
};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

static REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Responses skipped while waiting for ours, left over from timed-out requests
const MAX_SKIPPED_RESPONSES: u32 = 1000;

fn next_request_id() -> u32 {
    loop {
        // id 0 is reserved for responses to undecodable frames
        let id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Connection state for health tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Connected and healthy
    Connected,
    /// Connected but heartbeats are failing
    Degraded,
    /// Disconnected
    Disconnected,
    /// Never connected
    #[default]
    Initial,
}

/// Connection health information
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    /// Last successful heartbeat
    pub last_ping: Option<Instant>,
    /// Consecutive heartbeat failures
    pub failures: u32,
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    /// Check if connection is healthy enough for requests
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Degraded
        )
    }

    /// Get time since last successful ping
    pub fn time_since_ping(&self) -> Option<Duration> {
        self.last_ping.map(|t| t.elapsed())
    }
}

/// Write `request` and read until its response arrives
async fn exchange(stream: &mut TcpStream, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
    write_message(stream, request).await?;
    let mut skipped: u32 = 0;
    loop {
        let response: ResponseEnvelope = read_message(stream).await?;
        if response.id == request.id {
            return Ok(response);
        }
        if response.id == 0 && response.is_error {
            // the diver could not read our frame and is closing
            return Err(ClientError::from_response(&response));
        }
        skipped += 1;
        if skipped >= MAX_SKIPPED_RESPONSES {
            return Err(ClientError::Protocol(format!(
                "Skipped {} responses without receiving id {}",
                skipped, request.id
            )));
        }
        debug!(target: "diver_client::client", expected = request.id, got = response.id, "Skipping stale response");
    }
}

struct ClientInner {
    config: ClientConfig,
    pid: ProcessId,
    stream: RwLock<Option<Arc<Mutex<TcpStream>>>>,
    connected: AtomicBool,
    registered: AtomicBool,
    health: parking_lot::RwLock<ConnectionHealth>,
    heartbeat_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    callbacks: OnceCell<CallbackListener>,
    trace: parking_lot::RwLock<Option<TraceContext>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat_handle.lock().take() {
            handle.abort();
        }
    }
}

impl ClientInner {
    async fn send(&self, command: Command) -> Result<ResponseEnvelope> {
        let name = command.name();
        let mut request = RequestEnvelope::new(next_request_id(), command).with_session(self.pid);
        if let Some(trace) = self.trace.read().clone() {
            request = request.with_trace(trace);
        }
        let id = request.id;
        debug!(target: "diver_client::client", command = name, id, "Sending request");

        let stream_arc = {
            let guard = self.stream.read().await;
            guard.as_ref().cloned().ok_or_else(|| {
                debug!(target: "diver_client::client", command = name, id, "Request failed: not connected");
                ClientError::NotConnected
            })?
        };

        // requests on one connection are answered in order, so the stream is
        // held from write until the matching response is read
        let lock_timeout_ms = (self.config.timeout_ms / 10).clamp(1000, 5000);
        let mut stream = timeout(Duration::from_millis(lock_timeout_ms), stream_arc.lock_owned())
            .await
            .map_err(|_| {
                warn!(
                    target: "diver_client::client",
                    command = name,
                    id,
                    lock_timeout_ms,
                    "Timeout waiting for stream lock"
                );
                ClientError::Timeout(lock_timeout_ms)
            })?;

        let exchanged = exchange(&mut stream, &request);
        let result = match timeout(Duration::from_millis(self.config.timeout_ms), exchanged).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.config.timeout_ms)),
        };
        drop(stream);

        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.connection_lost(e).await;
            }
        }
        result
    }

    async fn connection_lost(&self, err: &ClientError) {
        warn!(target: "diver_client::client", error = %err, "Connection to diver lost");
        *self.stream.write().await = None;
        self.connected.store(false, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        let mut health = self.health.write();
        health.state = ConnectionState::Disconnected;
        health.last_error = Some(err.to_string());
    }

    fn record_heartbeat(&self, outcome: std::result::Result<(), String>, max_failures: u32) {
        let mut health = self.health.write();
        match outcome {
            Ok(()) => {
                if health.failures > 0 {
                    info!(
                        target: "diver_client::client",
                        previous_failures = health.failures,
                        "Heartbeat recovered after failures"
                    );
                }
                health.state = ConnectionState::Connected;
                health.last_ping = Some(Instant::now());
                health.failures = 0;
                health.last_error = None;
            }
            Err(message) => {
                health.failures += 1;
                warn!(
                    target: "diver_client::client",
                    error = %message,
                    failures = health.failures,
                    max_failures,
                    "Heartbeat failed"
                );
                health.last_error = Some(message);
                if health.failures >= max_failures {
                    health.state = ConnectionState::Disconnected;
                    self.connected.store(false, Ordering::SeqCst);
                    error!(
                        target: "diver_client::client",
                        "Connection marked as disconnected after {} heartbeat failures",
                        health.failures
                    );
                } else {
                    health.state = ConnectionState::Degraded;
                }
            }
        }
    }
}

/// Connection to a diver, owning one session
#[derive(Clone)]
pub struct DiverClient {
    inner: Arc<ClientInner>,
}

impl DiverClient {
    /// Create a client; nothing is sent until [`connect`](Self::connect)
    pub fn new(config: ClientConfig) -> Self {
        let pid = config.session_pid();
        Self {
            inner: Arc::new(ClientInner {
                config,
                pid,
                stream: RwLock::new(None),
                connected: AtomicBool::new(false),
                registered: AtomicBool::new(false),
                health: parking_lot::RwLock::new(ConnectionHealth::default()),
                heartbeat_handle: parking_lot::Mutex::new(None),
                callbacks: OnceCell::new(),
                trace: parking_lot::RwLock::new(None),
            }),
        }
    }

    /// Create a client and connect it
    pub async fn open(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config);
        client.connect().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Session key registered with the diver
    pub fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> ConnectionHealth {
        self.inner.health.read().clone()
    }

    /// Attach a trace context to every following request
    pub fn set_trace_context(&self, trace: Option<TraceContext>) {
        *self.inner.trace.write() = trace;
    }

    /// Connect and register, retrying per the configured policy
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_retry(&self.inner.config.retry).await
    }

    /// Connect with custom retry configuration.
    ///
    /// Only failures to reach the diver are retried; a rejected
    /// registration is returned as is.
    pub async fn connect_with_retry(&self, retry_config: &RetryConfig) -> Result<()> {
        let addr = self.inner.config.diver_address();
        let mut attempts = 0;
        let mut backoff_ms = retry_config.initial_backoff_ms;

        loop {
            attempts += 1;
            debug!(
                target: "diver_client::client",
                address = %addr,
                attempt = attempts,
                max_attempts = retry_config.max_retries + 1,
                "Connecting to diver"
            );

            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    *self.inner.stream.write().await = Some(Arc::new(Mutex::new(stream)));
                    self.inner.connected.store(true, Ordering::SeqCst);

                    if let Err(e) = self.register().await {
                        warn!(target: "diver_client::client", pid = self.inner.pid, error = %e, "Registration rejected");
                        self.drop_connection().await;
                        return Err(e);
                    }

                    {
                        let mut health = self.inner.health.write();
                        *health = ConnectionHealth {
                            state: ConnectionState::Connected,
                            last_ping: Some(Instant::now()),
                            ..Default::default()
                        };
                    }
                    info!(target: "diver_client::client", address = %addr, pid = self.inner.pid, "Connected to diver");

                    if self.inner.config.heartbeat.enabled {
                        self.start_heartbeat();
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempts > retry_config.max_retries {
                        error!(
                            target: "diver_client::client",
                            attempts,
                            error = %e,
                            "Failed to connect to diver"
                        );
                        self.inner.health.write().last_error = Some(e.to_string());
                        return Err(ClientError::Connection(format!(
                            "Failed to connect to diver at {}: {}",
                            addr, e
                        )));
                    }

                    warn!(
                        target: "diver_client::client",
                        attempt = attempts,
                        error = %e,
                        backoff_ms,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = retry_config.next_backoff(backoff_ms);
                }
            }
        }
    }

    /// Single connection attempt; false if the diver is not reachable
    pub async fn try_connect(&self) -> bool {
        self.connect_with_retry(&RetryConfig::none()).await.is_ok()
    }

    async fn register(&self) -> Result<()> {
        let _: bool = self
            .request(Command::Register(RegisterRequest { pid: self.inner.pid }))
            .await?;
        self.inner.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_connection(&self) {
        self.stop_heartbeat();
        *self.inner.stream.write().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.registered.store(false, Ordering::SeqCst);
        self.inner.health.write().state = ConnectionState::Disconnected;
    }

    /// Close the connection without unregistering.
    ///
    /// The diver tears the session down when it sees the connection close,
    /// unless configured otherwise.
    pub async fn disconnect(&self) {
        self.drop_connection().await;
        info!(target: "diver_client::client", "Disconnected from diver");
    }

    /// Unregister this session and disconnect
    pub async fn close(&self) -> Result<UnregisterResponse> {
        let result = self.unregister(self.inner.pid, false).await;
        self.disconnect().await;
        result
    }

    /// Reconnect and register again
    pub async fn reconnect(&self) -> Result<()> {
        self.drop_connection().await;
        self.connect().await
    }

    /// Send a command and decode the response data
    pub async fn request<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let response = self.inner.send(command).await?;
        if response.is_error {
            return Err(ClientError::from_response(&response));
        }
        let data = response.data.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    /// Send request with automatic reconnect on connection loss
    pub async fn request_with_reconnect<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        match self.request(command.clone()).await {
            Err(e) if e.is_connection_loss() => {
                warn!(target: "diver_client::client", error = %e, "Connection lost, attempting reconnect");
                self.reconnect().await?;
                self.request(command).await
            }
            other => other,
        }
    }

    /// Start heartbeat task.
    ///
    /// Failures only update health; reconnecting is left to
    /// [`request_with_reconnect`](Self::request_with_reconnect).
    fn start_heartbeat(&self) {
        let heartbeat = self.inner.config.heartbeat.clone();
        let interval = Duration::from_millis(heartbeat.interval_ms);
        let heartbeat_timeout = Duration::from_millis(heartbeat.timeout_ms);
        let inner: Weak<ClientInner> = Arc::downgrade(&self.inner);

        debug!(
            target: "diver_client::client",
            interval_ms = heartbeat.interval_ms,
            timeout_ms = heartbeat.timeout_ms,
            max_failures = heartbeat.max_failures,
            "Starting heartbeat task"
        );

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.connected.load(Ordering::SeqCst) {
                    debug!(target: "diver_client::client", "Heartbeat stopping: connection marked as disconnected");
                    break;
                }

                let outcome = match timeout(heartbeat_timeout, inner.send(Command::Ping)).await {
                    Ok(Ok(response)) if !response.is_error => Ok(()),
                    Ok(Ok(response)) => Err(ClientError::from_response(&response).to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("Heartbeat timeout".to_string()),
                };
                inner.record_heartbeat(outcome, heartbeat.max_failures);
            }
        });

        if let Some(old) = self.inner.heartbeat_handle.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.inner.heartbeat_handle.lock().take() {
            handle.abort();
            debug!(target: "diver_client::client", "Heartbeat task aborted");
        }
    }

    // =========================================================================
    // Session and diver control
    // =========================================================================

    pub async fn ping(&self) -> Result<()> {
        let reply: String = self.request(Command::Ping).await?;
        if reply != PONG {
            return Err(ClientError::Protocol(format!("Unexpected ping reply '{}'", reply)));
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<DiverStatus> {
        self.request(Command::Status).await
    }

    /// Unregister `pid`. With `force`, an unknown pid is not an error.
    pub async fn unregister(&self, pid: ProcessId, force: bool) -> Result<UnregisterResponse> {
        let response: UnregisterResponse = self
            .request(Command::Unregister(UnregisterRequest { pid, force }))
            .await?;
        if pid == self.inner.pid {
            self.inner.registered.store(false, Ordering::SeqCst);
        }
        Ok(response)
    }

    /// Ask the diver to stop. Without `force` this fails while any session
    /// (including this one) is registered.
    pub async fn die(&self, force: bool) -> Result<()> {
        let _: bool = self.request(Command::Die(DieRequest { force })).await?;
        self.drop_connection().await;
        info!(target: "diver_client::client", force, "Diver is shutting down");
        Ok(())
    }

    // =========================================================================
    // Type inspection
    // =========================================================================

    pub async fn list_assemblies(&self) -> Result<Vec<String>> {
        self.request(Command::ListAssemblies).await
    }

    pub async fn list_types(&self, assembly: &str) -> Result<Vec<String>> {
        self.request(Command::ListTypes(ListTypesRequest {
            assembly: assembly.to_string(),
        }))
        .await
    }

    pub async fn dump_type(&self, assembly: Option<&str>, type_name: &str) -> Result<TypeDump> {
        self.request(Command::DumpType(DumpTypeRequest {
            assembly: assembly.map(str::to_string),
            type_name: type_name.to_string(),
        }))
        .await
    }

    /// Live instances whose type matches `type_filter` (`*` wildcards)
    pub async fn search_heap(&self, type_filter: &str) -> Result<Vec<ObjectAddress>> {
        let response: SearchHeapResponse = self
            .request(Command::SearchHeap(SearchHeapRequest {
                type_filter: type_filter.to_string(),
            }))
            .await?;
        Ok(response.objects)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResult> {
        self.request(Command::Invoke(request)).await
    }

    /// Invoke `method_name`; `target: None` calls a static method
    pub async fn invoke_method(
        &self,
        target: Option<&RemoteHandle>,
        type_full_name: &str,
        method_name: &str,
        args: Vec<ObjectOrPrimitive>,
    ) -> Result<ObjectOrPrimitive> {
        let result = self
            .invoke(InvocationRequest {
                target: target.cloned(),
                type_full_name: type_full_name.to_string(),
                method_name: method_name.to_string(),
                generic_args: Vec::new(),
                args,
            })
            .await?;
        Ok(result.return_value.unwrap_or(ObjectOrPrimitive::Null))
    }

    pub async fn get_field(
        &self,
        target: Option<&RemoteHandle>,
        type_full_name: &str,
        field_name: &str,
    ) -> Result<ObjectOrPrimitive> {
        self.request(Command::GetField(GetFieldRequest {
            target: target.cloned(),
            type_full_name: type_full_name.to_string(),
            field_name: field_name.to_string(),
        }))
        .await
    }

    pub async fn set_field(
        &self,
        target: Option<&RemoteHandle>,
        type_full_name: &str,
        field_name: &str,
        value: ObjectOrPrimitive,
    ) -> Result<()> {
        self.request(Command::SetField(SetFieldRequest {
            target: target.cloned(),
            type_full_name: type_full_name.to_string(),
            field_name: field_name.to_string(),
            value,
        }))
        .await
    }

    pub async fn create_object(
        &self,
        type_full_name: &str,
        args: Vec<ObjectOrPrimitive>,
    ) -> Result<RemoteHandle> {
        self.request(Command::CreateObject(CreateObjectRequest {
            type_full_name: type_full_name.to_string(),
            args,
        }))
        .await
    }

    /// Turn a heap search result into a handle owned by this session
    pub async fn pin_object(&self, address: &ObjectAddress) -> Result<RemoteHandle> {
        self.request(Command::PinObject(PinObjectRequest {
            address: address.address,
            type_name: address.type_name.clone(),
        }))
        .await
    }

    /// Drop this session's reference; true if the diver unpinned the object
    pub async fn release_object(&self, handle: &RemoteHandle) -> Result<bool> {
        self.request(Command::ReleaseObject(ReleaseObjectRequest {
            handle: handle.clone(),
        }))
        .await
    }

    pub async fn get_item(&self, target: &RemoteHandle, index: u64) -> Result<ObjectOrPrimitive> {
        self.request(Command::GetItem(GetItemRequest {
            target: target.clone(),
            index,
        }))
        .await
    }

    pub async fn query_collection(
        &self,
        target: &RemoteHandle,
        query: CollectionQuery,
    ) -> Result<QueryCollectionResponse> {
        self.request(Command::QueryCollection(QueryCollectionRequest {
            target: target.clone(),
            query,
        }))
        .await
    }

    // =========================================================================
    // Proxies
    // =========================================================================

    /// Proxy for a handle this session owns
    pub fn proxy(&self, handle: RemoteHandle) -> RemoteObject {
        RemoteObject::new(self.clone(), handle)
    }

    /// Proxy over a type's static members
    pub fn static_type(&self, type_full_name: &str) -> RemoteObject {
        RemoteObject::for_type(self.clone(), type_full_name)
    }

    /// Construct an object in the target and wrap it
    pub async fn create(
        &self,
        type_full_name: &str,
        args: Vec<ObjectOrPrimitive>,
    ) -> Result<RemoteObject> {
        Ok(self.proxy(self.create_object(type_full_name, args).await?))
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Listener receiving this client's hook and event pushes, bound on first use
    pub async fn callback_listener(&self) -> Result<&CallbackListener> {
        self.inner
            .callbacks
            .get_or_try_init(|| CallbackListener::bind(&self.inner.config.callback_bind))
            .await
    }

    /// Subscribe with an explicit endpoint; pushes are not routed by this client
    pub async fn subscribe_event_at(
        &self,
        target: &RemoteHandle,
        event_name: &str,
        callback_endpoint: CallbackEndpoint,
    ) -> Result<Token> {
        let response: TokenResponse = self
            .request(Command::SubscribeEvent(SubscribeEventRequest {
                target: target.clone(),
                event_name: event_name.to_string(),
                callback_endpoint,
            }))
            .await?;
        Ok(response.token)
    }

    /// Subscribe to `event_name` on `target`, calling `handler` per fire
    pub async fn subscribe_event<F>(
        &self,
        target: &RemoteHandle,
        event_name: &str,
        handler: F,
    ) -> Result<Token>
    where
        F: Fn(CallbackInvocationRequest) + Send + Sync + 'static,
    {
        let listener = self.callback_listener().await?;
        let token = self
            .subscribe_event_at(target, event_name, listener.endpoint())
            .await?;
        listener.route(token, handler);
        Ok(token)
    }

    /// Subscribe and receive each fire on a channel
    pub async fn subscribe_event_channel(
        &self,
        target: &RemoteHandle,
        event_name: &str,
    ) -> Result<(Token, mpsc::UnboundedReceiver<CallbackInvocationRequest>)> {
        let listener = self.callback_listener().await?;
        let token = self
            .subscribe_event_at(target, event_name, listener.endpoint())
            .await?;
        Ok((token, listener.channel(token)))
    }

    pub async fn unsubscribe_event(&self, token: Token) -> Result<()> {
        self.request::<()>(Command::UnsubscribeEvent(TokenRequest { token }))
            .await?;
        if let Some(listener) = self.inner.callbacks.get() {
            listener.remove(token);
        }
        Ok(())
    }

    /// Hook with an explicit endpoint; pushes are not routed by this client
    pub async fn hook_method_at(&self, request: HookMethodRequest) -> Result<Token> {
        let response: TokenResponse = self.request(Command::HookMethod(request)).await?;
        Ok(response.token)
    }

    /// Hook `type_full_name.method_name` at `position`, calling `handler`
    /// per invocation. `parameter_types` selects an overload; empty matches
    /// the only overload.
    pub async fn hook_method<F>(
        &self,
        type_full_name: &str,
        method_name: &str,
        parameter_types: &[&str],
        position: HookPosition,
        handler: F,
    ) -> Result<Token>
    where
        F: Fn(CallbackInvocationRequest) + Send + Sync + 'static,
    {
        let listener = self.callback_listener().await?;
        let token = self
            .hook_method_at(HookMethodRequest {
                type_full_name: type_full_name.to_string(),
                method_name: method_name.to_string(),
                parameter_types: parameter_types.iter().map(|p| p.to_string()).collect(),
                position,
                callback_endpoint: listener.endpoint(),
            })
            .await?;
        listener.route(token, handler);
        Ok(token)
    }

    /// Hook and receive each invocation on a channel
    pub async fn hook_method_channel(
        &self,
        type_full_name: &str,
        method_name: &str,
        parameter_types: &[&str],
        position: HookPosition,
    ) -> Result<(Token, mpsc::UnboundedReceiver<CallbackInvocationRequest>)> {
        let listener = self.callback_listener().await?;
        let token = self
            .hook_method_at(HookMethodRequest {
                type_full_name: type_full_name.to_string(),
                method_name: method_name.to_string(),
                parameter_types: parameter_types.iter().map(|p| p.to_string()).collect(),
                position,
                callback_endpoint: listener.endpoint(),
            })
            .await?;
        Ok((token, listener.channel(token)))
    }

    pub async fn unhook_method(&self, token: Token) -> Result<()> {
        self.request::<()>(Command::UnhookMethod(TokenRequest { token }))
            .await?;
        if let Some(listener) = self.inner.callbacks.get() {
            listener.remove(token);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DiverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiverClient")
            .field("address", &self.inner.config.diver_address())
            .field("pid", &self.inner.pid)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_nonzero_and_increasing() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, 0);
        assert!(b > a);
    }

    #[test]
    fn test_health_defaults() {
        let health = ConnectionHealth::default();
        assert_eq!(health.state, ConnectionState::Initial);
        assert!(!health.is_healthy());
        assert!(health.time_since_ping().is_none());
    }

    #[tokio::test]
    async fn test_request_without_connection() {
        let client = DiverClient::new(ClientConfig::with_port(1).with_pid(5));
        assert!(!client.is_connected());
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_failure_without_retry() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = DiverClient::new(ClientConfig::with_port(port).with_pid(6));
        assert!(!client.try_connect().await);

        let health = client.health();
        assert!(!health.is_healthy());
        assert!(health.last_error.is_some());
    }

    #[test]
    fn test_heartbeat_marks_disconnected_after_max_failures() {
        let client = DiverClient::new(ClientConfig::default().with_pid(7));
        client.inner.connected.store(true, Ordering::SeqCst);

        client.inner.record_heartbeat(Err("timeout".to_string()), 2);
        assert_eq!(client.health().state, ConnectionState::Degraded);
        assert!(client.is_connected());

        client.inner.record_heartbeat(Err("timeout".to_string()), 2);
        assert_eq!(client.health().state, ConnectionState::Disconnected);
        assert!(!client.is_connected());

        client.inner.record_heartbeat(Ok(()), 2);
        let health = client.health();
        assert_eq!(health.state, ConnectionState::Connected);
        assert_eq!(health.failures, 0);
        assert!(health.last_ping.is_some());
    }
}
