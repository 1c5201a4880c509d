//! Method hooks
//!
//! Each registration installs its own runtime hook. When it fires, the
//! captured context is converted for the owning session and queued for the
//! dispatcher. The original call is never blocked or altered.

use crate::dispatch::{now_millis, CallbackDispatcher, TokenCell, TokenTable};
use crate::registry::ObjectRegistry;
use crate::runtime::{HookContext, HookId, ManagedRuntime, MethodTarget, Value};
use crate::session::SessionTable;
use diver_common::ipc::{CallbackContext, CallbackInvocationRequest, HookMethodRequest};
use diver_common::{
    CallbackEndpoint, Error, HookPosition, ObjectOrPrimitive, ProcessId, Result, Token,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A live hook registration
#[derive(Debug, Clone)]
pub struct HookRegistration {
    pub token: Token,
    pub target: MethodTarget,
    pub position: HookPosition,
    pub endpoint: CallbackEndpoint,
    pub owner: ProcessId,
    runtime_hook: HookId,
}

pub struct HookManager {
    runtime: Arc<dyn ManagedRuntime>,
    registry: Arc<ObjectRegistry>,
    sessions: Arc<SessionTable>,
    tokens: Arc<TokenTable>,
    dispatcher: Arc<CallbackDispatcher>,
    hooks: RwLock<HashMap<Token, HookRegistration>>,
}

impl HookManager {
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
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Install a hook for `owner`
    pub fn hook(&self, owner: ProcessId, request: &HookMethodRequest) -> Result<Token> {
        request.callback_endpoint.socket_addr()?;
        let target = MethodTarget {
            type_full_name: request.type_full_name.clone(),
            method_name: request.method_name.clone(),
            parameter_types: request.parameter_types.clone(),
        };

        let cell = self
            .tokens
            .issue(owner, request.callback_endpoint.clone());
        let token = cell.token();
        let callback = self.forwarder(Arc::clone(&cell), request.position);

        let runtime_hook = match self.runtime.install_hook(&target, request.position, callback) {
            Ok(id) => id,
            Err(e) => {
                self.tokens.cancel(token);
                return Err(e);
            }
        };

        if !self.sessions.record_hook(owner, token) {
            self.tokens.cancel(token);
            let _ = self.runtime.remove_hook(runtime_hook);
            return Err(Error::session(format!("Session {} has ended", owner)));
        }

        self.hooks.write().insert(
            token,
            HookRegistration {
                token,
                target: target.clone(),
                position: request.position,
                endpoint: request.callback_endpoint.clone(),
                owner,
                runtime_hook,
            },
        );
        self.tokens.activate(token);

        info!(
            target: "diver_agent::hooks",
            %token,
            owner,
            method = %format!("{}.{}", target.type_full_name, target.method_name),
            position = %request.position,
            endpoint = %request.callback_endpoint,
            "Hook installed"
        );
        Ok(token)
    }

    /// Remove a hook. Once this returns, no push for the token is sent.
    ///
    /// `requester` of `None` skips the ownership check (teardown paths).
    pub fn unhook(&self, token: Token, requester: Option<ProcessId>) -> Result<()> {
        {
            let hooks = self.hooks.read();
            let registration = hooks
                .get(&token)
                .ok_or_else(|| Error::NotFound(format!("Unknown hook token {}", token)))?;
            if let Some(pid) = requester {
                if registration.owner != pid {
                    return Err(Error::session(format!(
                        "Hook {} is owned by session {}",
                        token, registration.owner
                    )));
                }
            }
        }

        let Some(registration) = self.hooks.write().remove(&token) else {
            return Err(Error::NotFound(format!("Unknown hook token {}", token)));
        };
        self.tokens.cancel(token);
        if let Err(e) = self.runtime.remove_hook(registration.runtime_hook) {
            warn!(target: "diver_agent::hooks", %token, error = %e, "Runtime hook already gone");
        }
        self.sessions.forget_hook(registration.owner, token);

        debug!(target: "diver_agent::hooks", %token, "Hook removed");
        Ok(())
    }

    /// Remove every hook; returns how many were removed
    pub fn remove_all(&self) -> usize {
        let tokens: Vec<Token> = self.hooks.read().keys().copied().collect();
        tokens
            .into_iter()
            .filter(|token| self.unhook(*token, None).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, token: Token) -> Option<HookRegistration> {
        self.hooks.read().get(&token).cloned()
    }

    /// Callback run on the target thread each time the hook fires
    fn forwarder(
        &self,
        cell: Arc<TokenCell>,
        position: HookPosition,
    ) -> crate::runtime::HookCallback {
        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let dispatcher = Arc::clone(&self.dispatcher);

        Arc::new(move |ctx: &HookContext| {
            // held while pinning so a cancelled token cannot leave pins behind
            let Some(state) = cell.try_active() else {
                return;
            };
            let owner = cell.owner();
            let export = |value: &Value| -> ObjectOrPrimitive {
                sessions
                    .export(&registry, value, owner)
                    .unwrap_or_else(|e| {
                        warn!(
                            target: "diver_agent::hooks",
                            token = %cell.token(),
                            error = %e,
                            "Could not export hook value"
                        );
                        ObjectOrPrimitive::Null
                    })
            };

            let (return_value, error) = match position {
                HookPosition::Pre => (None, None),
                HookPosition::Post | HookPosition::Finalizer => {
                    (ctx.return_value.as_ref().map(&export), ctx.error.clone())
                }
            };
            let request = CallbackInvocationRequest {
                timestamp: now_millis(),
                token: cell.token(),
                args: ctx.args.iter().map(&export).collect(),
                context: CallbackContext::Hook {
                    position,
                    type_full_name: ctx.type_full_name.clone(),
                    method_name: ctx.method_name.clone(),
                    instance: ctx
                        .instance
                        .as_ref()
                        .map(|obj| export(&Value::Object(obj.clone()))),
                    return_value,
                    error,
                },
            };
            drop(state);
            dispatcher.enqueue(&cell, request);
        })
    }
}
