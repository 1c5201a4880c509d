//! Event subscriptions on remote objects

use crate::dispatch::{now_millis, CallbackDispatcher, TokenTable};
use crate::registry::ObjectRegistry;
use crate::runtime::{EventListener, ListenerId, ManagedRuntime, Value};
use crate::session::SessionTable;
use diver_common::ipc::{CallbackContext, CallbackInvocationRequest, SubscribeEventRequest};
use diver_common::{
    CallbackEndpoint, Error, HandleId, ObjectOrPrimitive, ProcessId, Result, Token,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EventSubscription {
    pub token: Token,
    pub handle: HandleId,
    pub event_name: String,
    pub endpoint: CallbackEndpoint,
    pub owner: ProcessId,
    listener: ListenerId,
}

/// Forwards event firings to controllers.
///
/// A subscription holds its own registry reference on the target so the
/// object stays pinned while anyone listens.
pub struct EventForwarder {
    runtime: Arc<dyn ManagedRuntime>,
    registry: Arc<ObjectRegistry>,
    sessions: Arc<SessionTable>,
    tokens: Arc<TokenTable>,
    dispatcher: Arc<CallbackDispatcher>,
    subscriptions: RwLock<HashMap<Token, EventSubscription>>,
}

impl EventForwarder {
    pub fn new(
        runtime: Arc<dyn ManagedRuntime>,
        registry: Arc<ObjectRegistry>,
        sessions: Arc<SessionTable>,
        tokens: Arc<TokenTable>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            runtime,
            registry,
            sessions,
            tokens,
            dispatcher,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, owner: ProcessId, request: &SubscribeEventRequest) -> Result<Token> {
        request.callback_endpoint.socket_addr()?;
        let target = self.registry.resolve(&request.target)?;
        let handle = request.target.handle;
        self.registry.retain(handle)?;

        let cell = self.tokens.issue(owner, request.callback_endpoint.clone());
        let token = cell.token();
        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let dispatcher = Arc::clone(&self.dispatcher);
        let event_name = request.event_name.clone();

        let listener: EventListener = Arc::new(move |args: &[Value]| {
            let Some(state) = cell.try_active() else {
                return;
            };
            let args = args
                .iter()
                .map(|value| {
                    sessions
                        .export(&registry, value, owner)
                        .unwrap_or_else(|e| {
                            warn!(
                                target: "diver_agent::events",
                                token = %cell.token(),
                                error = %e,
                                "Could not export event argument"
                            );
                            ObjectOrPrimitive::Null
                        })
                })
                .collect();
            let request = CallbackInvocationRequest {
                timestamp: now_millis(),
                token: cell.token(),
                args,
                context: CallbackContext::Event {
                    event_name: event_name.clone(),
                },
            };
            drop(state);
            dispatcher.enqueue(&cell, request);
        });

        let listener = match self
            .runtime
            .subscribe_event(target.id, &request.event_name, listener)
        {
            Ok(id) => id,
            Err(e) => {
                self.tokens.cancel(token);
                let _ = self.registry.unretain(handle);
                return Err(e);
            }
        };

        if !self.sessions.record_event(owner, token) {
            self.tokens.cancel(token);
            let _ = self
                .runtime
                .unsubscribe_event(target.id, &request.event_name, listener);
            let _ = self.registry.unretain(handle);
            return Err(Error::session(format!("Session {} has ended", owner)));
        }

        self.subscriptions.write().insert(
            token,
            EventSubscription {
                token,
                handle,
                event_name: request.event_name.clone(),
                endpoint: request.callback_endpoint.clone(),
                owner,
                listener,
            },
        );
        self.tokens.activate(token);

        info!(
            target: "diver_agent::events",
            %token,
            owner,
            object = %target.object_address(),
            event = %request.event_name,
            "Event subscribed"
        );
        Ok(token)
    }

    /// Stop forwarding an event. `requester` of `None` skips the ownership check.
    pub fn unsubscribe(&self, token: Token, requester: Option<ProcessId>) -> Result<()> {
        {
            let subs = self.subscriptions.read();
            let sub = subs
                .get(&token)
                .ok_or_else(|| Error::NotFound(format!("Unknown event token {}", token)))?;
            if let Some(pid) = requester {
                if sub.owner != pid {
                    return Err(Error::session(format!(
                        "Subscription {} is owned by session {}",
                        token, sub.owner
                    )));
                }
            }
        }

        let Some(sub) = self.subscriptions.write().remove(&token) else {
            return Err(Error::NotFound(format!("Unknown event token {}", token)));
        };
        self.tokens.cancel(token);

        // the object may already be gone; the listener went with it
        let detached = self
            .registry
            .object_of(sub.handle)
            .map(|object| {
                self.runtime
                    .unsubscribe_event(object.id, &sub.event_name, sub.listener)
            });
        if let Some(Err(e)) = detached {
            debug!(target: "diver_agent::events", %token, error = %e, "Listener already detached");
        }
        if let Err(e) = self.registry.unretain(sub.handle) {
            debug!(target: "diver_agent::events", %token, error = %e, "Subscription reference already released");
        }
        self.sessions.forget_event(sub.owner, token);

        debug!(target: "diver_agent::events", %token, "Event unsubscribed");
        Ok(())
    }

    pub fn remove_all(&self) -> usize {
        let tokens: Vec<Token> = self.subscriptions.read().keys().copied().collect();
        tokens
            .into_iter()
            .filter(|token| self.unsubscribe(*token, None).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, token: Token) -> Option<EventSubscription> {
        self.subscriptions.read().get(&token).cloned()
    }
}
