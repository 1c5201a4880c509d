//! The diver service
//!
//! One `Diver` owns every table for one loaded instance: registry, sessions,
//! tokens, hooks, event subscriptions and the callback dispatcher. The
//! server hands it decoded requests; it never touches sockets itself.

use crate::config::DiverConfig;
use crate::dispatch::{CallbackDispatcher, CallbackTransport, TcpCallbackTransport, TokenTable};
use crate::events::EventForwarder;
use crate::heap::HeapInspector;
use crate::hooks::HookManager;
use crate::registry::ObjectRegistry;
use crate::runtime::{ManagedRuntime, ObjectRef, Value};
use crate::session::{ConnectionId, DuplicateSessionPolicy, SessionTable};
use diver_common::ipc::{
    Command, CreateObjectRequest, DiverStatus, GetFieldRequest, GetItemRequest,
    InvocationRequest, InvocationResult, QueryCollectionRequest, QueryCollectionResponse,
    RequestEnvelope, ResponseEnvelope, SearchHeapResponse, SetFieldRequest, TokenResponse,
    UnregisterResponse, PONG, PROTOCOL_VERSION,
};
use diver_common::{
    CollectionQuery, Error, ObjectOrPrimitive, Primitive, ProcessId, RemoteHandle, Result, VERSION,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Reply = Result<serde_json::Value>;

fn reply<T: Serialize>(value: T) -> Reply {
    Ok(serde_json::to_value(value)?)
}

pub struct Diver {
    config: DiverConfig,
    runtime: Arc<dyn ManagedRuntime>,
    heap: Arc<HeapInspector>,
    registry: Arc<ObjectRegistry>,
    sessions: Arc<SessionTable>,
    dispatcher: Arc<CallbackDispatcher>,
    hooks: HookManager,
    events: EventForwarder,
    /// Serializes register, unregister and teardown
    lifecycle: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Diver {
    /// Diver delivering callbacks over TCP
    pub fn new(runtime: Arc<dyn ManagedRuntime>, config: DiverConfig) -> Result<Self> {
        let transport = Arc::new(TcpCallbackTransport::new(config.callback_send_timeout()));
        Self::with_transport(runtime, config, transport)
    }

    pub fn with_transport(
        runtime: Arc<dyn ManagedRuntime>,
        config: DiverConfig,
        transport: Arc<dyn CallbackTransport>,
    ) -> Result<Self> {
        let heap = Arc::new(HeapInspector::new(Arc::clone(&runtime)));
        let registry = Arc::new(ObjectRegistry::new(Arc::clone(&heap)));
        let sessions = Arc::new(SessionTable::new());
        let tokens = Arc::new(TokenTable::new());
        let dispatcher = Arc::new(CallbackDispatcher::start(
            config.callback_queue_capacity,
            transport,
        )?);

        let hooks = HookManager::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&tokens),
            Arc::clone(&dispatcher),
        );
        let events = EventForwarder::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&sessions),
            tokens,
            Arc::clone(&dispatcher),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            runtime,
            heap,
            registry,
            sessions,
            dispatcher,
            hooks,
            events,
            lifecycle: Mutex::new(()),
            shutdown,
        })
    }

    pub fn config(&self) -> &DiverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ObjectRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.dispatcher
    }

    /// Flips to `true` once `die` succeeds
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Handle one request. Never panics on bad input; every failure becomes
    /// an error response.
    pub fn handle(&self, connection: Option<ConnectionId>, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.id;
        let command = request.body.name();
        debug!(
            target: "diver_agent::diver",
            id,
            command,
            session = ?request.session,
            trace_id = request.trace_context.as_ref().map(|t| t.trace_id.as_str()),
            connection = ?connection,
            "Handling request"
        );

        let result = self
            .session_for(&request)
            .and_then(|pid| self.dispatch(connection, pid, request.body));
        match result {
            Ok(data) => ResponseEnvelope::success(id, &data),
            Err(e) => {
                debug!(target: "diver_agent::diver", id, command, error = %e, "Request failed");
                ResponseEnvelope::from_error(id, &e)
            }
        }
    }

    /// Registered pid for commands that need one; 0 for the rest
    fn session_for(&self, request: &RequestEnvelope) -> Result<ProcessId> {
        if !request.body.requires_session() {
            return Ok(request.session.unwrap_or_default());
        }
        let pid = request.session.ok_or_else(|| {
            Error::session(format!("{} requires a registered session", request.body.name()))
        })?;
        if !self.sessions.contains(pid) {
            return Err(Error::session(format!("Process {} is not registered", pid)));
        }
        Ok(pid)
    }

    fn dispatch(&self, connection: Option<ConnectionId>, pid: ProcessId, command: Command) -> Reply {
        match command {
            Command::Register(req) => self.register(connection, req.pid),
            Command::Unregister(req) => self.unregister(req.pid, req.force),
            Command::Ping => reply(PONG),
            Command::Status => reply(self.status()),
            Command::ListAssemblies => reply(self.runtime.assemblies()),
            Command::ListTypes(req) => reply(self.runtime.types_in(&req.assembly)?),
            Command::DumpType(req) => {
                reply(self.heap.resolve_type(req.assembly.as_deref(), &req.type_name)?)
            }
            Command::Invoke(req) => self.invoke(pid, req),
            Command::GetField(req) => self.get_field(pid, req),
            Command::SetField(req) => self.set_field(req),
            Command::CreateObject(req) => self.create_object(pid, req),
            Command::PinObject(req) => {
                let object = self.heap.validate(req.address, &req.type_name)?;
                reply(self.export_handle(&object, pid)?)
            }
            Command::ReleaseObject(req) => self.release_object(pid, &req.handle),
            Command::GetItem(req) => self.get_item(pid, req),
            Command::QueryCollection(req) => self.query_collection(pid, req),
            Command::SubscribeEvent(req) => reply(TokenResponse {
                token: self.events.subscribe(pid, &req)?,
            }),
            Command::UnsubscribeEvent(req) => reply(self.events.unsubscribe(req.token, Some(pid))?),
            Command::HookMethod(req) => reply(TokenResponse {
                token: self.hooks.hook(pid, &req)?,
            }),
            Command::UnhookMethod(req) => reply(self.hooks.unhook(req.token, Some(pid))?),
            Command::SearchHeap(req) => reply(SearchHeapResponse {
                objects: self.heap.search(&req.type_filter)?,
            }),
            Command::Die(req) => self.die(req.force),
        }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    fn register(&self, connection: Option<ConnectionId>, pid: ProcessId) -> Reply {
        let _lifecycle = self.lifecycle.lock();
        if self.is_stopping() {
            return Err(Error::session("Diver is shutting down"));
        }
        if self.sessions.contains(pid) {
            match self.config.duplicate_session_policy {
                DuplicateSessionPolicy::Reject => {
                    return Err(Error::session(format!(
                        "Process {} is already registered",
                        pid
                    )))
                }
                DuplicateSessionPolicy::Supersede => {
                    info!(target: "diver_agent::diver", pid, "Superseding existing session");
                    self.teardown_locked(pid);
                }
            }
        }
        self.sessions.register(pid, connection)?;
        reply(true)
    }

    fn unregister(&self, pid: ProcessId, force: bool) -> Reply {
        let _lifecycle = self.lifecycle.lock();
        let was_removed = self.teardown_locked(pid);
        if !was_removed && !force {
            return Err(Error::session(format!("Process {} is not registered", pid)));
        }
        reply(UnregisterResponse {
            was_removed,
            other_clients_count: self.sessions.len(),
        })
    }

    /// Tear down `pid`'s session; returns false if there was none
    pub fn teardown_session(&self, pid: ProcessId) -> bool {
        let _lifecycle = self.lifecycle.lock();
        self.teardown_locked(pid)
    }

    fn teardown_locked(&self, pid: ProcessId) -> bool {
        let Some(session) = self.sessions.remove(pid) else {
            return false;
        };

        // tokens first: once cancelled no push can pin anything new
        let hooks = session
            .hook_tokens
            .iter()
            .filter(|t| self.hooks.unhook(**t, None).is_ok())
            .count();
        let events = session
            .event_tokens
            .iter()
            .filter(|t| self.events.unsubscribe(**t, None).is_ok())
            .count();
        let released = self.registry.release_all_for_session(pid);

        let mut swept = 0;
        if self.sessions.is_empty() {
            swept += self.hooks.remove_all();
            swept += self.events.remove_all();
            swept += self.registry.clear();
        }

        info!(
            target: "diver_agent::diver",
            pid,
            hooks,
            events,
            released,
            swept,
            remaining = self.sessions.len(),
            "Session torn down"
        );
        true
    }

    /// Tear down sessions registered over a closed connection
    pub fn connection_closed(&self, connection: ConnectionId) -> usize {
        if !self.config.teardown_on_disconnect {
            return 0;
        }
        self.sessions
            .registered_by(connection)
            .into_iter()
            .filter(|pid| {
                warn!(
                    target: "diver_agent::diver",
                    pid,
                    %connection,
                    "Connection closed without unregister"
                );
                self.teardown_session(*pid)
            })
            .count()
    }

    fn die(&self, force: bool) -> Reply {
        // a register cannot slip in between the check and the flag
        let _lifecycle = self.lifecycle.lock();
        let remaining = self.sessions.len();
        if remaining > 0 && !force {
            return Err(Error::session(format!(
                "Cannot die: {} clients remaining",
                remaining
            )));
        }
        info!(target: "diver_agent::diver", force, remaining, "Shutdown requested");
        self.shutdown.send_replace(true);
        reply(true)
    }

    /// Tear down every session and stop the dispatcher
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let _lifecycle = self.lifecycle.lock();
        for pid in self.sessions.pids() {
            self.teardown_locked(pid);
        }
        self.hooks.remove_all();
        self.events.remove_all();
        self.registry.clear();
        self.dispatcher.shutdown();
        info!(target: "diver_agent::diver", "Diver shut down");
    }

    pub fn status(&self) -> DiverStatus {
        DiverStatus {
            version: VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            pid: std::process::id(),
            sessions: self.sessions.pids(),
            pinned_objects: self.registry.len(),
            active_hooks: self.hooks.len(),
            active_subscriptions: self.events.len(),
            queued_callbacks: self.dispatcher.queued(),
            dropped_callbacks: self.dispatcher.dropped(),
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    fn export(&self, value: &Value, pid: ProcessId) -> Result<ObjectOrPrimitive> {
        self.sessions.export(&self.registry, value, pid)
    }

    fn export_handle(&self, object: &ObjectRef, pid: ProcessId) -> Result<RemoteHandle> {
        match self.export(&Value::Object(object.clone()), pid)? {
            ObjectOrPrimitive::Remote(handle) => Ok(handle),
            _ => Err(Error::Internal("Object did not export as a handle".to_string())),
        }
    }

    fn resolve_target(&self, target: Option<&RemoteHandle>) -> Result<Option<ObjectRef>> {
        target.map(|h| self.registry.resolve(h)).transpose()
    }

    fn import_all(&self, args: &[ObjectOrPrimitive]) -> Result<Vec<Value>> {
        args.iter().map(|a| self.registry.import(a)).collect()
    }

    fn invoke(&self, pid: ProcessId, req: InvocationRequest) -> Reply {
        let target = self.resolve_target(req.target.as_ref())?;
        let args = self.import_all(&req.args)?;
        let returned = self.runtime.invoke(
            target.map(|t| t.id),
            &req.type_full_name,
            &req.method_name,
            &req.generic_args,
            args,
        )?;
        let result = match returned {
            None => InvocationResult::void(),
            Some(value) => InvocationResult::value(self.export(&value, pid)?),
        };
        reply(result)
    }

    fn get_field(&self, pid: ProcessId, req: GetFieldRequest) -> Reply {
        let target = self.resolve_target(req.target.as_ref())?;
        let value =
            self.runtime
                .get_field(target.map(|t| t.id), &req.type_full_name, &req.field_name)?;
        reply(self.export(&value, pid)?)
    }

    fn set_field(&self, req: SetFieldRequest) -> Reply {
        let target = self.resolve_target(req.target.as_ref())?;
        let value = self.registry.import(&req.value)?;
        self.runtime.set_field(
            target.map(|t| t.id),
            &req.type_full_name,
            &req.field_name,
            value,
        )?;
        reply(())
    }

    fn create_object(&self, pid: ProcessId, req: CreateObjectRequest) -> Reply {
        let args = self.import_all(&req.args)?;
        let object = self.runtime.create_object(&req.type_full_name, args)?;
        reply(self.export_handle(&object, pid)?)
    }

    fn release_object(&self, pid: ProcessId, handle: &RemoteHandle) -> Reply {
        let freed = self.registry.release(handle.handle, pid)?;
        if self.registry.ref_count(handle.handle, pid) == 0 {
            self.sessions.forget_handle(pid, handle.handle);
        }
        reply(freed)
    }

    fn get_item(&self, pid: ProcessId, req: GetItemRequest) -> Reply {
        let target = self.registry.resolve(&req.target)?;
        let index = usize::try_from(req.index)
            .map_err(|_| Error::protocol(format!("Index {} out of range", req.index)))?;
        let value = self.runtime.element_at(target.id, index)?;
        reply(self.export(&value, pid)?)
    }

    fn query_collection(&self, pid: ProcessId, req: QueryCollectionRequest) -> Reply {
        let target = self.registry.resolve(&req.target)?;
        let elements = self.runtime.enumerate_collection(target.id)?;
        let selected = self.run_query(elements, &req.query)?;
        let matched = selected.matched;
        let items = selected
            .items
            .iter()
            .map(|v| self.export(v, pid))
            .collect::<Result<Vec<_>>>()?;
        reply(QueryCollectionResponse { items, matched })
    }

    fn run_query(&self, elements: Vec<Value>, query: &CollectionQuery) -> Result<QueryOutcome> {
        let mut items = match &query.filter {
            Some(predicate) => {
                let mut kept = Vec::new();
                for element in elements {
                    let key = self.member_value(&element, predicate.member.as_deref())?;
                    if key.is_some_and(|k| predicate.op.evaluate(&k, &predicate.value)) {
                        kept.push(element);
                    }
                }
                kept
            }
            None => elements,
        };
        let matched = items.len();

        if let Some(selector) = &query.order_by {
            let mut keyed = items
                .into_iter()
                .map(|e| Ok((self.member_value(&e, selector.member.as_deref())?, e)))
                .collect::<Result<Vec<_>>>()?;
            keyed.sort_by(|(a, _), (b, _)| {
                let ord = compare_keys(a.as_ref(), b.as_ref());
                if selector.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            items = keyed.into_iter().map(|(_, e)| e).collect();
        }

        if let Some(take) = query.take {
            items.truncate(take);
        }
        Ok(QueryOutcome { items, matched })
    }

    /// Primitive at `element.member` (dotted paths walk nested objects);
    /// `None` when the path ends on a non-primitive
    fn member_value(&self, element: &Value, member: Option<&str>) -> Result<Option<Primitive>> {
        let mut current = element.clone();
        if let Some(path) = member {
            for name in path.split('.') {
                current = match &current {
                    Value::Object(obj) => {
                        self.runtime
                            .get_field(Some(obj.id), &obj.type_name, name)?
                    }
                    _ => return Ok(None),
                };
            }
        }
        Ok(current.as_primitive().cloned())
    }
}

struct QueryOutcome {
    items: Vec<Value>,
    matched: usize,
}

/// Missing keys sort last
fn compare_keys(a: Option<&Primitive>, b: Option<&Primitive>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{wait_until, RecordingTransport};
    use crate::runtime::sim::{SimRuntime, TypeBuilder};
    use diver_common::ipc::{
        DieRequest, HookMethodRequest, PinObjectRequest, RegisterRequest, SubscribeEventRequest,
        TokenRequest, UnregisterRequest,
    };
    use diver_common::{
        CallbackEndpoint, CompareOp, ErrorKind, HookPosition, KeySelector, Predicate, Token,
    };

    struct Fixture {
        rt: Arc<SimRuntime>,
        transport: Arc<RecordingTransport>,
        diver: Diver,
        next_id: std::sync::atomic::AtomicU32,
    }

    impl Fixture {
        fn send(&self, pid: Option<ProcessId>, body: Command) -> ResponseEnvelope {
            let id = self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut request = RequestEnvelope::new(id, body);
            request.session = pid;
            let response = self.diver.handle(Some(ConnectionId(1)), request);
            assert_eq!(response.id, id);
            response
        }

        fn ok<T: serde::de::DeserializeOwned>(&self, pid: ProcessId, body: Command) -> T {
            self.send(Some(pid), body).into_result().unwrap()
        }

        fn register(&self, pid: ProcessId) {
            let _: bool = self.ok(pid, Command::Register(RegisterRequest { pid }));
        }
    }

    fn game_runtime() -> Arc<SimRuntime> {
        let rt = Arc::new(SimRuntime::new());
        rt.define_type(
            TypeBuilder::new("Game", "Game.Enemy")
                .field("Name", "string")
                .field("Hp", "int")
                .constructor(&[("name", "string"), ("hp", "int")], |rt, frame| {
                    let this = frame.this()?.id;
                    rt.set_field(Some(this), "Game.Enemy", "Name", frame.arg(0)?.clone())?;
                    rt.set_field(Some(this), "Game.Enemy", "Hp", frame.arg(1)?.clone())?;
                    Ok(None)
                })
                .event("Died", &["string"])
                .method("Hit", "int", &[("damage", "int")], |rt, frame| {
                    let this = frame.this()?.id;
                    let hp = rt
                        .get_field(Some(this), "Game.Enemy", "Hp")?
                        .as_primitive()
                        .and_then(|p| p.as_i64())
                        .unwrap_or(0);
                    let left = hp - frame.int_arg(0)?;
                    rt.set_field(Some(this), "Game.Enemy", "Hp", Value::from(left))?;
                    Ok(Some(Value::from(left)))
                })
                .method("Explode", "void", &[], |_, _| {
                    Err(SimRuntime::throw("Enemy exploded"))
                }),
        );
        rt.define_type(TypeBuilder::new("Game", "Game.EnemyList").collection_of("Game.Enemy"));
        rt
    }

    fn fixture_with(config: DiverConfig) -> Fixture {
        let rt = game_runtime();
        let transport = Arc::new(RecordingTransport::default());
        let diver = Diver::with_transport(rt.clone(), config, transport.clone()).unwrap();
        Fixture {
            rt,
            transport,
            diver,
            next_id: std::sync::atomic::AtomicU32::new(1),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DiverConfig::default())
    }

    fn create_enemy(f: &Fixture, pid: ProcessId, name: &str, hp: i64) -> RemoteHandle {
        f.ok(
            pid,
            Command::CreateObject(CreateObjectRequest {
                type_full_name: "Game.Enemy".to_string(),
                args: vec![ObjectOrPrimitive::from(name), ObjectOrPrimitive::from(hp)],
            }),
        )
    }

    fn endpoint() -> CallbackEndpoint {
        CallbackEndpoint::new("127.0.0.1:4200")
    }

    #[test]
    fn test_ping_and_status_without_session() {
        let f = fixture();
        let pong: String = f.send(None, Command::Ping).into_result().unwrap();
        assert_eq!(pong, PONG);
        let status: DiverStatus = f.send(None, Command::Status).into_result().unwrap();
        assert_eq!(status.protocol_version, PROTOCOL_VERSION);
        assert!(status.sessions.is_empty());
    }

    #[test]
    fn test_session_required() {
        let f = fixture();
        let body = Command::CreateObject(CreateObjectRequest {
            type_full_name: "Game.Enemy".to_string(),
            args: vec![],
        });
        let response = f.send(None, body.clone());
        assert_eq!(response.error_kind, Some(ErrorKind::Session));
        let response = f.send(Some(77), body);
        assert_eq!(response.error_kind, Some(ErrorKind::Session));
    }

    #[test]
    fn test_duplicate_register_rejected_by_default() {
        let f = fixture();
        f.register(10);
        let response = f.send(Some(10), Command::Register(RegisterRequest { pid: 10 }));
        assert!(response.is_error);
        assert!(response.error_message.unwrap().contains("already registered"));
    }

    #[test]
    fn test_supersede_tears_down_previous_session() {
        let f = fixture_with(DiverConfig {
            duplicate_session_policy: DuplicateSessionPolicy::Supersede,
            ..Default::default()
        });
        f.register(10);
        let enemy = create_enemy(&f, 10, "orc", 10);
        f.register(10);
        assert!(!f.diver.registry().contains(enemy.handle));
        assert!(f.diver.sessions().get(10).unwrap().handles.is_empty());
    }

    #[test]
    fn test_invoke_and_fields() {
        let f = fixture();
        f.register(1);
        let enemy = create_enemy(&f, 1, "orc", 30);
        let result: InvocationResult = f.ok(
            1,
            Command::Invoke(InvocationRequest {
                target: Some(enemy.clone()),
                type_full_name: "Game.Enemy".to_string(),
                method_name: "Hit".to_string(),
                generic_args: vec![],
                args: vec![ObjectOrPrimitive::from(12)],
            }),
        );
        assert!(!result.void_return);
        assert_eq!(result.return_value, Some(ObjectOrPrimitive::from(18)));

        let _: () = f.ok(
            1,
            Command::SetField(SetFieldRequest {
                target: Some(enemy.clone()),
                type_full_name: "Game.Enemy".to_string(),
                field_name: "Name".to_string(),
                value: ObjectOrPrimitive::from("goblin"),
            }),
        );
        let name: ObjectOrPrimitive = f.ok(
            1,
            Command::GetField(GetFieldRequest {
                target: Some(enemy),
                type_full_name: "Game.Enemy".to_string(),
                field_name: "Name".to_string(),
            }),
        );
        assert_eq!(name, ObjectOrPrimitive::from("goblin"));
    }

    #[test]
    fn test_throwing_invoke_then_ping() {
        let f = fixture();
        f.register(1);
        let enemy = create_enemy(&f, 1, "orc", 30);
        let response = f.send(
            Some(1),
            Command::Invoke(InvocationRequest {
                target: Some(enemy),
                type_full_name: "Game.Enemy".to_string(),
                method_name: "Explode".to_string(),
                generic_args: vec![],
                args: vec![],
            }),
        );
        assert_eq!(response.error_kind, Some(ErrorKind::Target));
        assert_eq!(response.error_message.as_deref(), Some("Enemy exploded"));
        assert!(response
            .error_stack_trace
            .unwrap()
            .contains("Game.Enemy.Explode"));

        let pong: String = f.send(Some(1), Command::Ping).into_result().unwrap();
        assert_eq!(pong, PONG);
    }

    #[test]
    fn test_pin_and_release() {
        let f = fixture();
        f.register(1);
        f.register(2);
        let obj = f.rt.new_object("Game.Enemy").unwrap();
        f.rt.add_root(obj.id);

        let pin = |pid| -> RemoteHandle {
            f.ok(
                pid,
                Command::PinObject(PinObjectRequest {
                    address: obj.address,
                    type_name: "Game.Enemy".to_string(),
                }),
            )
        };
        let a = pin(1);
        let b = pin(2);
        assert_eq!(a.handle, b.handle);

        let release = |pid, handle: &RemoteHandle| -> bool {
            f.ok(
                pid,
                Command::ReleaseObject(diver_common::ipc::ReleaseObjectRequest {
                    handle: handle.clone(),
                }),
            )
        };
        assert!(!release(1, &a));
        assert!(f.diver.registry().contains(a.handle));
        assert!(release(2, &b));
        assert!(!f.diver.registry().contains(a.handle));
        assert_eq!(f.rt.pin_count(obj.id), 0);
    }

    #[test]
    fn test_pin_invalid_address_is_stale() {
        let f = fixture();
        f.register(1);
        let response = f.send(
            Some(1),
            Command::PinObject(PinObjectRequest {
                address: 0x10,
                type_name: "Game.Enemy".to_string(),
            }),
        );
        assert_eq!(response.error_kind, Some(ErrorKind::StaleReference));
    }

    #[test]
    fn test_query_collection_filter_sort_take() {
        let f = fixture();
        f.register(1);
        let list = f.rt.new_object("Game.EnemyList").unwrap();
        f.rt.add_root(list.id);
        for (name, hp) in [("a", 5), ("b", 50), ("c", 20), ("d", 80)] {
            let e = f
                .rt
                .create_object("Game.Enemy", vec![Value::from(name), Value::from(hp)])
                .unwrap();
            f.rt.push_item(list.id, Value::Object(e)).unwrap();
        }
        let handle: RemoteHandle = f.ok(
            1,
            Command::PinObject(PinObjectRequest {
                address: list.address,
                type_name: "Game.EnemyList".to_string(),
            }),
        );

        let response: QueryCollectionResponse = f.ok(
            1,
            Command::QueryCollection(QueryCollectionRequest {
                target: handle.clone(),
                query: CollectionQuery {
                    filter: Some(Predicate {
                        member: Some("Hp".to_string()),
                        op: CompareOp::Gt,
                        value: Primitive::Int(10),
                    }),
                    order_by: Some(KeySelector {
                        member: Some("Hp".to_string()),
                        descending: true,
                    }),
                    take: Some(2),
                },
            }),
        );
        assert_eq!(response.matched, 3);
        assert_eq!(response.items.len(), 2);

        let names: Vec<ObjectOrPrimitive> = response
            .items
            .iter()
            .map(|item| {
                f.ok(
                    1,
                    Command::GetField(GetFieldRequest {
                        target: Some(item.as_remote().unwrap().clone()),
                        type_full_name: "Game.Enemy".to_string(),
                        field_name: "Name".to_string(),
                    }),
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![ObjectOrPrimitive::from("d"), ObjectOrPrimitive::from("b")]
        );

        let second: ObjectOrPrimitive = f.ok(
            1,
            Command::GetItem(GetItemRequest {
                target: handle,
                index: 1,
            }),
        );
        assert_eq!(second.as_remote().unwrap().type_name, "Game.Enemy");
    }

    #[test]
    fn test_unregister_cancels_tokens_and_releases() {
        let f = fixture();
        f.register(1);
        let enemy = create_enemy(&f, 1, "orc", 30);
        let sub: TokenResponse = f.ok(
            1,
            Command::SubscribeEvent(SubscribeEventRequest {
                target: enemy.clone(),
                event_name: "Died".to_string(),
                callback_endpoint: endpoint(),
            }),
        );
        let hook: TokenResponse = f.ok(
            1,
            Command::HookMethod(HookMethodRequest {
                type_full_name: "Game.Enemy".to_string(),
                method_name: "Hit".to_string(),
                parameter_types: vec![],
                position: HookPosition::Pre,
                callback_endpoint: endpoint(),
            }),
        );
        assert_ne!(sub.token, hook.token);

        let response: UnregisterResponse = f.ok(
            1,
            Command::Unregister(UnregisterRequest {
                pid: 1,
                force: false,
            }),
        );
        assert!(response.was_removed);
        assert_eq!(response.other_clients_count, 0);

        let status = f.diver.status();
        assert_eq!(status.active_hooks, 0);
        assert_eq!(status.active_subscriptions, 0);
        assert_eq!(status.pinned_objects, 0);

        let obj = f.diver.registry().object_of(enemy.handle);
        assert!(obj.is_none());
        let live = f.rt.object_at(enemy.address).unwrap();
        assert_eq!(f.rt.raise_event(live.object.id, "Died", &[Value::from("x")]).unwrap(), 0);
        f.diver.dispatcher().shutdown();
        assert!(f.transport.sent.lock().is_empty());
    }

    #[test]
    fn test_unregister_unknown_pid() {
        let f = fixture();
        let response = f.send(None, Command::Unregister(UnregisterRequest { pid: 5, force: false }));
        assert_eq!(response.error_kind, Some(ErrorKind::Session));
        let forced: UnregisterResponse = f
            .send(None, Command::Unregister(UnregisterRequest { pid: 5, force: true }))
            .into_result()
            .unwrap();
        assert!(!forced.was_removed);
    }

    #[test]
    fn test_unregister_keeps_other_sessions_objects() {
        let f = fixture();
        f.register(1);
        f.register(2);
        let enemy = create_enemy(&f, 2, "orc", 30);
        let _: UnregisterResponse =
            f.ok(1, Command::Unregister(UnregisterRequest { pid: 1, force: false }));
        assert!(f.diver.sessions().contains(2));
        assert!(f.diver.registry().contains(enemy.handle));

        let last: UnregisterResponse =
            f.ok(2, Command::Unregister(UnregisterRequest { pid: 2, force: false }));
        assert_eq!(last.other_clients_count, 0);
        assert!(f.diver.registry().is_empty());
    }

    #[test]
    fn test_hook_forwards_and_unhook_by_other_session_fails() {
        let f = fixture();
        f.register(1);
        f.register(2);
        let enemy = create_enemy(&f, 1, "orc", 30);
        let hook: TokenResponse = f.ok(
            1,
            Command::HookMethod(HookMethodRequest {
                type_full_name: "Game.Enemy".to_string(),
                method_name: "Hit".to_string(),
                parameter_types: vec!["int".to_string()],
                position: HookPosition::Post,
                callback_endpoint: endpoint(),
            }),
        );
        let _: InvocationResult = f.ok(
            1,
            Command::Invoke(InvocationRequest {
                target: Some(enemy),
                type_full_name: "Game.Enemy".to_string(),
                method_name: "Hit".to_string(),
                generic_args: vec![],
                args: vec![ObjectOrPrimitive::from(1)],
            }),
        );
        assert!(wait_until(|| f.diver.dispatcher().delivered() == 1));

        let response = f.send(Some(2), Command::UnhookMethod(TokenRequest { token: hook.token }));
        assert_eq!(response.error_kind, Some(ErrorKind::Session));
        let response = f.send(Some(1), Command::UnhookMethod(TokenRequest { token: Token(999) }));
        assert_eq!(response.error_kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_die_requires_force_with_sessions() {
        let f = fixture();
        f.register(1);
        let response = f.send(None, Command::Die(DieRequest { force: false }));
        assert!(response.error_message.unwrap().contains("clients remaining"));
        assert!(!f.diver.is_stopping());

        let mut signal = f.diver.shutdown_signal();
        let _: bool = f
            .send(None, Command::Die(DieRequest { force: true }))
            .into_result()
            .unwrap();
        assert!(f.diver.is_stopping());
        assert!(*signal.borrow_and_update());

        let response = f.send(None, Command::Register(RegisterRequest { pid: 3 }));
        assert!(response.is_error);
    }

    #[test]
    fn test_register_racing_die_leaves_no_session() {
        for _ in 0..20 {
            let f = fixture();
            let registering = std::sync::atomic::AtomicBool::new(true);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    for pid in 1..=50 {
                        f.send(None, Command::Register(RegisterRequest { pid }));
                        f.send(None, Command::Unregister(UnregisterRequest { pid, force: true }));
                    }
                    registering.store(false, std::sync::atomic::Ordering::SeqCst);
                });
                scope.spawn(|| {
                    while registering.load(std::sync::atomic::Ordering::SeqCst) {
                        let response = f.send(None, Command::Die(DieRequest { force: false }));
                        if !response.is_error {
                            break;
                        }
                    }
                });
            });

            if f.diver.is_stopping() {
                assert!(f.diver.sessions().is_empty());
                let response = f.send(None, Command::Register(RegisterRequest { pid: 99 }));
                assert!(response.is_error);
            }
        }
    }

    #[test]
    fn test_connection_close_tears_down() {
        let f = fixture();
        f.register(1);
        assert_eq!(f.diver.connection_closed(ConnectionId(2)), 0);
        assert_eq!(f.diver.connection_closed(ConnectionId(1)), 1);
        assert!(f.diver.sessions().is_empty());
    }

    #[test]
    fn test_search_heap() {
        let f = fixture();
        let e = f.rt.new_object("Game.Enemy").unwrap();
        f.rt.add_root(e.id);
        let found: SearchHeapResponse = f
            .send(
                None,
                Command::SearchHeap(diver_common::ipc::SearchHeapRequest {
                    type_filter: "Game.*".to_string(),
                }),
            )
            .into_result()
            .unwrap();
        assert_eq!(found.objects, vec![e.object_address()]);
    }
}
