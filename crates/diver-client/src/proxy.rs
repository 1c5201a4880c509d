//! Dynamic remote proxies
//!
//! A [`RemoteObject`] stands for an object (or a type's statics) inside the
//! target. Member access is lazy: `obj.member("Owner").member("Name")` only
//! records a path, and nothing is sent until [`read`](RemoteObject::read),
//! [`write`](RemoteObject::write) or [`invoke`](RemoteObject::invoke).
//! Objects pinned while walking a path are released once the operation is
//! done; the final result is returned as a proxy without another round trip.

use crate::client::DiverClient;
use crate::error::{ClientError, Result};
use diver_common::ipc::CallbackInvocationRequest;
use diver_common::{
    CollectionQuery, CompareOp, KeySelector, ObjectOrPrimitive, Predicate, Primitive,
    RemoteHandle, Token,
};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum Root {
    Instance(RemoteHandle),
    Type(String),
}

/// Resolved receiver of a member access
struct Location {
    target: Option<RemoteHandle>,
    type_name: String,
}

/// Value read from the target
#[derive(Debug, Clone)]
pub enum RemoteValue {
    Null,
    Primitive(Primitive),
    Object(RemoteObject),
}

impl RemoteValue {
    fn from_wire(client: &DiverClient, value: ObjectOrPrimitive) -> Self {
        match value {
            ObjectOrPrimitive::Null => RemoteValue::Null,
            ObjectOrPrimitive::Primitive(p) => RemoteValue::Primitive(p),
            ObjectOrPrimitive::Remote(handle) => RemoteValue::Object(client.proxy(handle)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RemoteValue::Null)
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            RemoteValue::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_primitive().and_then(Primitive::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_primitive().and_then(Primitive::as_str)
    }

    pub fn as_object(&self) -> Option<&RemoteObject> {
        match self {
            RemoteValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<RemoteObject> {
        match self {
            RemoteValue::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// Proxy for a remote object, a type's statics, or a member path below either
#[derive(Clone)]
pub struct RemoteObject {
    client: DiverClient,
    root: Root,
    path: Vec<String>,
}

impl RemoteObject {
    pub(crate) fn new(client: DiverClient, handle: RemoteHandle) -> Self {
        Self {
            client,
            root: Root::Instance(handle),
            path: Vec::new(),
        }
    }

    pub(crate) fn for_type(client: DiverClient, type_full_name: &str) -> Self {
        Self {
            client,
            root: Root::Type(type_full_name.to_string()),
            path: Vec::new(),
        }
    }

    /// Handle behind this proxy, if it denotes an object directly
    pub fn handle(&self) -> Option<&RemoteHandle> {
        match (&self.root, self.path.is_empty()) {
            (Root::Instance(handle), true) => Some(handle),
            _ => None,
        }
    }

    /// Declared type of the root object or type
    pub fn type_name(&self) -> &str {
        match &self.root {
            Root::Instance(handle) => &handle.type_name,
            Root::Type(name) => name,
        }
    }

    /// Member path below the root, e.g. `Owner.Name`
    pub fn path(&self) -> String {
        self.path.join(".")
    }

    /// Lazily select a field, property or method; sends nothing
    pub fn member(&self, name: &str) -> RemoteObject {
        let mut next = self.clone();
        next.path.push(name.to_string());
        next
    }

    /// This object as an argument for another call
    pub fn as_argument(&self) -> Result<ObjectOrPrimitive> {
        self.handle()
            .cloned()
            .map(ObjectOrPrimitive::Remote)
            .ok_or_else(|| self.unresolved("pass as argument"))
    }

    fn unresolved(&self, action: &str) -> ClientError {
        ClientError::InvalidOperation(format!(
            "Cannot {} '{}{}{}': not a resolved object",
            action,
            self.type_name(),
            if self.path.is_empty() { "" } else { "." },
            self.path()
        ))
    }

    fn root_location(&self) -> Location {
        match &self.root {
            Root::Instance(handle) => Location {
                target: Some(handle.clone()),
                type_name: handle.type_name.clone(),
            },
            Root::Type(name) => Location {
                target: None,
                type_name: name.clone(),
            },
        }
    }

    /// Follow `segments` from the root, one `getField` per step
    async fn walk(&self, segments: &[String], walked: &mut Vec<RemoteHandle>) -> Result<Location> {
        let mut location = self.root_location();
        for (i, segment) in segments.iter().enumerate() {
            let value = self
                .client
                .get_field(location.target.as_ref(), &location.type_name, segment)
                .await?;
            match value {
                ObjectOrPrimitive::Remote(handle) => {
                    walked.push(handle.clone());
                    location = Location {
                        type_name: handle.type_name.clone(),
                        target: Some(handle),
                    };
                }
                other => {
                    let kind = if other.is_null() { "null" } else { "not an object" };
                    return Err(ClientError::InvalidOperation(format!(
                        "'{}' is {}",
                        segments[..=i].join("."),
                        kind
                    )));
                }
            }
        }
        Ok(location)
    }

    async fn release_walked(&self, walked: Vec<RemoteHandle>) {
        for handle in walked {
            if let Err(e) = self.client.release_object(&handle).await {
                debug!(target: "diver_client::proxy", handle = %handle.handle, error = %e, "Failed to release path object");
            }
        }
    }

    /// Run `op` on the receiver of the last path segment
    async fn on_parent<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Location, String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let Some((last, parents)) = self.path.split_last() else {
            return Err(self.unresolved("access a member of"));
        };
        let mut walked = Vec::new();
        let result = match self.walk(parents, &mut walked).await {
            Ok(location) => op(location, last.clone()).await,
            Err(e) => Err(e),
        };
        self.release_walked(walked).await;
        result
    }

    /// Resolve the whole path to an object and run `op` on its handle
    async fn on_object<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(RemoteHandle) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Some(handle) = self.handle() {
            return op(handle.clone()).await;
        }
        let mut walked = Vec::new();
        let result = match self.walk(&self.path, &mut walked).await {
            Ok(Location {
                target: Some(handle),
                ..
            }) => op(handle).await,
            Ok(_) => Err(self.unresolved("use")),
            Err(e) => Err(e),
        };
        self.release_walked(walked).await;
        result
    }

    /// Read the value at this path
    pub async fn read(&self) -> Result<RemoteValue> {
        if let Some(handle) = self.handle() {
            return Ok(RemoteValue::Object(self.client.proxy(handle.clone())));
        }
        let client = &self.client;
        let value = self
            .on_parent(|location, field| async move {
                client
                    .get_field(location.target.as_ref(), &location.type_name, &field)
                    .await
            })
            .await?;
        Ok(RemoteValue::from_wire(client, value))
    }

    /// Assign the field at this path
    pub async fn write(&self, value: impl Into<ObjectOrPrimitive>) -> Result<()> {
        let value = value.into();
        let client = &self.client;
        self.on_parent(|location, field| async move {
            client
                .set_field(location.target.as_ref(), &location.type_name, &field, value)
                .await
        })
        .await
    }

    /// Call the method named by the last path segment
    pub async fn invoke(&self, args: Vec<ObjectOrPrimitive>) -> Result<RemoteValue> {
        let client = &self.client;
        let value = self
            .on_parent(|location, method| async move {
                client
                    .invoke_method(location.target.as_ref(), &location.type_name, &method, args)
                    .await
            })
            .await?;
        Ok(RemoteValue::from_wire(client, value))
    }

    /// Shorthand for `member(method).invoke(args)`
    pub async fn call(&self, method: &str, args: Vec<ObjectOrPrimitive>) -> Result<RemoteValue> {
        self.member(method).invoke(args).await
    }

    /// Element `index` of the collection at this path
    pub async fn index(&self, index: u64) -> Result<RemoteValue> {
        let client = &self.client;
        let value = self
            .on_object(|handle| async move { client.get_item(&handle, index).await })
            .await?;
        Ok(RemoteValue::from_wire(client, value))
    }

    /// Start a remote filter/sort/take over the collection at this path
    pub fn query(&self) -> RemoteQuery {
        RemoteQuery {
            source: self.clone(),
            query: CollectionQuery::default(),
        }
    }

    /// Subscribe to an event on the object at this path
    pub async fn subscribe<F>(&self, event_name: &str, handler: F) -> Result<Token>
    where
        F: Fn(CallbackInvocationRequest) + Send + Sync + 'static,
    {
        let client = &self.client;
        self.on_object(|handle| async move {
            client.subscribe_event(&handle, event_name, handler).await
        })
        .await
    }

    /// Subscribe and receive each fire on a channel
    pub async fn subscribe_channel(
        &self,
        event_name: &str,
    ) -> Result<(Token, mpsc::UnboundedReceiver<CallbackInvocationRequest>)> {
        let client = &self.client;
        self.on_object(|handle| async move { client.subscribe_event_channel(&handle, event_name).await })
            .await
    }

    /// Drop this session's reference to the object
    pub async fn release(self) -> Result<bool> {
        match self.handle() {
            Some(handle) => self.client.release_object(handle).await,
            None => Err(self.unresolved("release")),
        }
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RemoteObject");
        match &self.root {
            Root::Instance(handle) => s.field("handle", &handle.handle),
            Root::Type(name) => s.field("type", name),
        };
        s.field("path", &self.path()).finish()
    }
}

/// Items returned by [`RemoteQuery::execute`]
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub items: Vec<RemoteValue>,
    /// Elements that passed the filter before `take`
    pub matched: usize,
}

/// Query builder evaluated by the diver in one round trip
#[derive(Debug, Clone)]
pub struct RemoteQuery {
    source: RemoteObject,
    query: CollectionQuery,
}

fn member_key(member: &str) -> Option<String> {
    (!member.is_empty()).then(|| member.to_string())
}

impl RemoteQuery {
    /// Keep elements where `element.member op value`; an empty member
    /// compares the element itself
    pub fn filter(mut self, member: &str, op: CompareOp, value: impl Into<Primitive>) -> Self {
        self.query.filter = Some(Predicate {
            member: member_key(member),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, member: &str) -> Self {
        self.query.order_by = Some(KeySelector {
            member: member_key(member),
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, member: &str) -> Self {
        self.query.order_by = Some(KeySelector {
            member: member_key(member),
            descending: true,
        });
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.query.take = Some(count);
        self
    }

    pub fn as_query(&self) -> &CollectionQuery {
        &self.query
    }

    pub async fn execute(self) -> Result<QueryResult> {
        let client = &self.source.client;
        let query = self.query;
        let response = self
            .source
            .on_object(|handle| async move { client.query_collection(&handle, query).await })
            .await?;
        Ok(QueryResult {
            items: response
                .items
                .into_iter()
                .map(|v| RemoteValue::from_wire(client, v))
                .collect(),
            matched: response.matched,
        })
    }
}
