//! Client sessions
//!
//! A session is everything one controller pid owns: hook tokens, event
//! tokens and registry handles. Sessions are created by `register` and torn
//! down in one piece by the diver.

use crate::registry::ObjectRegistry;
use crate::runtime::Value;
use diver_common::{Error, HandleId, ObjectOrPrimitive, ProcessId, Result, Token};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Server-assigned id of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// What `register` does when the pid already has a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSessionPolicy {
    /// Fail the second registration
    #[default]
    Reject,
    /// Tear the existing session down, then register again
    Supersede,
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub pid: ProcessId,
    pub hook_tokens: BTreeSet<Token>,
    pub event_tokens: BTreeSet<Token>,
    pub handles: BTreeSet<HandleId>,
    /// Unix epoch milliseconds
    pub registered_at: u64,
    /// Connection that registered the session, if it came over the wire
    pub connection: Option<ConnectionId>,
}

impl ClientSession {
    fn new(pid: ProcessId, connection: Option<ConnectionId>) -> Self {
        Self {
            pid,
            hook_tokens: BTreeSet::new(),
            event_tokens: BTreeSet::new(),
            handles: BTreeSet::new(),
            registered_at: crate::dispatch::now_millis(),
            connection,
        }
    }
}

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<ProcessId, ClientSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session; fails if `pid` already has one
    pub fn register(&self, pid: ProcessId, connection: Option<ConnectionId>) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&pid) {
            return Err(Error::session(format!(
                "Process {} is already registered",
                pid
            )));
        }
        sessions.insert(pid, ClientSession::new(pid, connection));
        info!(
            target: "diver_agent::session",
            pid,
            connection = ?connection,
            total = sessions.len(),
            "Session registered"
        );
        Ok(())
    }

    /// Detach a session for teardown
    pub fn remove(&self, pid: ProcessId) -> Option<ClientSession> {
        let removed = self.sessions.write().remove(&pid);
        if removed.is_some() {
            debug!(target: "diver_agent::session", pid, "Session removed");
        }
        removed
    }

    /// Detach every session
    pub fn drain(&self) -> Vec<ClientSession> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.sessions.read().contains_key(&pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<ClientSession> {
        self.sessions.read().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self.sessions.read().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Sessions registered over `connection`
    pub fn registered_by(&self, connection: ConnectionId) -> Vec<ProcessId> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.connection == Some(connection))
            .map(|s| s.pid)
            .collect()
    }

    fn update(&self, pid: ProcessId, f: impl FnOnce(&mut ClientSession)) -> bool {
        match self.sessions.write().get_mut(&pid) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub fn record_hook(&self, pid: ProcessId, token: Token) -> bool {
        self.update(pid, |s| {
            s.hook_tokens.insert(token);
        })
    }

    pub fn record_event(&self, pid: ProcessId, token: Token) -> bool {
        self.update(pid, |s| {
            s.event_tokens.insert(token);
        })
    }

    pub fn record_handle(&self, pid: ProcessId, handle: HandleId) -> bool {
        self.update(pid, |s| {
            s.handles.insert(handle);
        })
    }

    pub fn forget_hook(&self, pid: ProcessId, token: Token) {
        self.update(pid, |s| {
            s.hook_tokens.remove(&token);
        });
    }

    pub fn forget_event(&self, pid: ProcessId, token: Token) {
        self.update(pid, |s| {
            s.event_tokens.remove(&token);
        });
    }

    pub fn forget_handle(&self, pid: ProcessId, handle: HandleId) {
        self.update(pid, |s| {
            s.handles.remove(&handle);
        });
    }

    /// Convert a runtime value for the wire, pinning objects for `owner`.
    ///
    /// Fails if the session ended meanwhile; the pin is undone in that case.
    pub fn export(
        &self,
        registry: &ObjectRegistry,
        value: &Value,
        owner: ProcessId,
    ) -> Result<ObjectOrPrimitive> {
        match value {
            Value::Null => Ok(ObjectOrPrimitive::Null),
            Value::Primitive(p) => Ok(ObjectOrPrimitive::Primitive(p.clone())),
            Value::Object(object) => {
                let handle = registry.pin(object, owner)?;
                if !self.record_handle(owner, handle.handle) {
                    let _ = registry.release(handle.handle, owner);
                    return Err(Error::session(format!("Session {} has ended", owner)));
                }
                Ok(ObjectOrPrimitive::Remote(handle))
            }
        }
    }
}
