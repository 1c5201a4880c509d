//! Execution engine seam
//!
//! Everything the diver does to the target goes through [`ManagedRuntime`].
//! Implementations must never hold internal locks while running target code,
//! hook callbacks or event listeners: those call back into the diver, which
//! calls back into the runtime.

pub mod sim;

use diver_common::{HookPosition, ObjectAddress, Primitive, Result, TypeDump};
use std::sync::Arc;

pub use sim::SimRuntime;

/// Identity of a managed object, stable across relocation and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Reference to a live object as seen at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub address: u64,
    pub type_name: String,
}

impl ObjectRef {
    pub fn object_address(&self) -> ObjectAddress {
        ObjectAddress::new(self.address, self.type_name.clone())
    }
}

/// Runtime-side value: objects carry identity, never a handle
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Primitive(Primitive),
    Object(ObjectRef),
}

impl Value {
    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            Value::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

macro_rules! primitive_into_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Primitive(v.into())
                }
            }
        )*
    };
}

primitive_into_value!(bool, i32, i64, u64, f64, char, &str, String, Primitive);

/// An allocated object found on the heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    pub object: ObjectRef,
    /// Reachable from a root (statics, runtime roots or pins)
    pub reachable: bool,
}

/// Method a hook attaches to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodTarget {
    pub type_full_name: String,
    pub method_name: String,
    /// Exact parameter type list; empty selects the only (or zero-arg) overload
    pub parameter_types: Vec<String>,
}

/// Context captured at a hook position
#[derive(Debug, Clone)]
pub struct HookContext {
    pub position: HookPosition,
    pub type_full_name: String,
    pub method_name: String,
    pub instance: Option<ObjectRef>,
    pub args: Vec<Value>,
    /// Post and finalizer only
    pub return_value: Option<Value>,
    /// Finalizer only, when the call failed
    pub error: Option<String>,
}

pub type HookCallback = Arc<dyn Fn(&HookContext) + Send + Sync>;
pub type EventListener = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Operations the diver needs from the target's execution engine
pub trait ManagedRuntime: Send + Sync + 'static {
    /// Names of loaded assemblies
    fn assemblies(&self) -> Vec<String>;

    /// Full names of the types an assembly defines
    fn types_in(&self, assembly: &str) -> Result<Vec<String>>;

    /// Describe a loaded type, optionally scoped to one assembly
    fn dump_type(&self, assembly: Option<&str>, type_name: &str) -> Result<TypeDump>;

    /// Whether a value of `actual` can be used where `expected` is required
    fn is_assignable(&self, actual: &str, expected: &str) -> bool;

    /// Object currently allocated at `address`
    fn object_at(&self, address: u64) -> Option<HeapObject>;

    /// Current location of an object by identity
    fn locate(&self, id: ObjectId) -> Option<HeapObject>;

    /// Every allocated object whose type name passes `filter`
    fn enumerate_instances(&self, filter: &dyn Fn(&str) -> bool) -> Vec<HeapObject>;

    fn pin(&self, id: ObjectId) -> Result<()>;

    fn unpin(&self, id: ObjectId);

    fn get_field(&self, target: Option<ObjectId>, type_name: &str, field: &str) -> Result<Value>;

    fn set_field(
        &self,
        target: Option<ObjectId>,
        type_name: &str,
        field: &str,
        value: Value,
    ) -> Result<()>;

    /// Run a method. `Ok(None)` means the method returns void.
    fn invoke(
        &self,
        target: Option<ObjectId>,
        type_name: &str,
        method: &str,
        generic_args: &[String],
        args: Vec<Value>,
    ) -> Result<Option<Value>>;

    fn create_object(&self, type_name: &str, args: Vec<Value>) -> Result<ObjectRef>;

    fn subscribe_event(
        &self,
        target: ObjectId,
        event: &str,
        listener: EventListener,
    ) -> Result<ListenerId>;

    fn unsubscribe_event(&self, target: ObjectId, event: &str, listener: ListenerId) -> Result<()>;

    fn install_hook(
        &self,
        target: &MethodTarget,
        position: HookPosition,
        callback: HookCallback,
    ) -> Result<HookId>;

    fn remove_hook(&self, id: HookId) -> Result<()>;

    /// Elements of a collection object, in order
    fn enumerate_collection(&self, target: ObjectId) -> Result<Vec<Value>>;

    fn element_at(&self, target: ObjectId, index: usize) -> Result<Value>;
}
