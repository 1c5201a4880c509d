//! In-memory managed runtime
//!
//! `SimRuntime` models the parts of a garbage-collected execution engine the
//! diver depends on: a type system with single inheritance, objects with
//! stable identity and movable addresses, static and runtime roots, pinning,
//! events, collections and method hooks. Method bodies are native closures.
//!
//! Collection and compaction only happen when asked for (`collect`,
//! `compact`, `relocate`), which makes address reuse reproducible.

use super::{
    EventListener, HeapObject, HookCallback, HookContext, HookId, ListenerId, ManagedRuntime,
    MethodTarget, ObjectId, ObjectRef, Value,
};
use diver_common::{
    Error, EventDump, FieldDump, HookPosition, MethodDump, ParameterDump, Primitive, Result,
    TypeDump,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// First address handed out by the allocator
pub const HEAP_BASE: u64 = 0x0200_0000;

/// Distance between consecutive object addresses
pub const OBJECT_STRIDE: u64 = 0x40;

/// Root of the type hierarchy
pub const OBJECT_TYPE: &str = "System.Object";

const CORE_ASSEMBLY: &str = "System.Private.CoreLib";
const CONSTRUCTOR_NAME: &str = ".ctor";
const PRIMITIVE_TYPES: &[&str] = &["bool", "int", "uint", "float", "char", "string"];

pub type NativeMethod =
    Arc<dyn Fn(&SimRuntime, &CallFrame) -> Result<Option<Value>> + Send + Sync>;
pub type PropertyGetter = Arc<dyn Fn(&SimRuntime, &ObjectRef) -> Result<Value> + Send + Sync>;

/// Arguments handed to a native method body
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub this: Option<ObjectRef>,
    pub args: Vec<Value>,
    pub generic_args: Vec<String>,
}

impl CallFrame {
    pub fn this(&self) -> Result<&ObjectRef> {
        self.this
            .as_ref()
            .ok_or_else(|| Error::target("Instance method called without an instance"))
    }

    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| Error::target(format!("Missing argument {}", index)))
    }

    pub fn int_arg(&self, index: usize) -> Result<i64> {
        self.arg(index)?
            .as_primitive()
            .and_then(Primitive::as_i64)
            .ok_or_else(|| Error::target(format!("Argument {} is not an integer", index)))
    }

    pub fn str_arg(&self, index: usize) -> Result<&str> {
        self.arg(index)?
            .as_primitive()
            .and_then(Primitive::as_str)
            .ok_or_else(|| Error::target(format!("Argument {} is not a string", index)))
    }
}

// =============================================================================
// Type definitions
// =============================================================================

#[derive(Clone)]
struct FieldDef {
    name: String,
    type_name: String,
    is_static: bool,
}

#[derive(Clone)]
struct PropertyDef {
    name: String,
    type_name: String,
    getter: PropertyGetter,
}

#[derive(Clone)]
struct MethodDef {
    name: String,
    return_type: String,
    params: Vec<(String, String)>,
    generic_params: Vec<String>,
    is_static: bool,
    body: NativeMethod,
}

impl MethodDef {
    fn param_types(&self) -> Vec<String> {
        self.params.iter().map(|(_, ty)| ty.clone()).collect()
    }

    fn is_void(&self) -> bool {
        self.return_type == "void"
    }

    fn dump(&self) -> MethodDump {
        MethodDump {
            name: self.name.clone(),
            return_type: self.return_type.clone(),
            parameters: self
                .params
                .iter()
                .map(|(name, ty)| ParameterDump {
                    name: name.clone(),
                    type_name: ty.clone(),
                })
                .collect(),
            generic_args: self.generic_params.clone(),
            is_static: self.is_static,
        }
    }
}

#[derive(Clone)]
struct EventDef {
    name: String,
    argument_types: Vec<String>,
}

/// A type as defined in the simulated runtime
pub struct TypeDef {
    assembly: String,
    full_name: String,
    base: Option<String>,
    fields: Vec<FieldDef>,
    static_values: Vec<(String, Value)>,
    properties: Vec<PropertyDef>,
    methods: Vec<MethodDef>,
    constructors: Vec<MethodDef>,
    events: Vec<EventDef>,
    element_type: Option<String>,
}

impl TypeDef {
    fn base_name(&self) -> Option<String> {
        match &self.base {
            Some(base) => Some(base.clone()),
            None if self.full_name != OBJECT_TYPE => Some(OBJECT_TYPE.to_string()),
            None => None,
        }
    }

    fn dump(&self) -> TypeDump {
        let constructors = if self.constructors.is_empty() {
            vec![MethodDump {
                name: CONSTRUCTOR_NAME.to_string(),
                return_type: "void".to_string(),
                parameters: Vec::new(),
                generic_args: Vec::new(),
                is_static: false,
            }]
        } else {
            self.constructors.iter().map(MethodDef::dump).collect()
        };

        TypeDump {
            assembly: self.assembly.clone(),
            full_type_name: self.full_name.clone(),
            base_type: self.base_name(),
            fields: self
                .fields
                .iter()
                .map(|f| FieldDump {
                    name: f.name.clone(),
                    type_name: f.type_name.clone(),
                    is_static: f.is_static,
                })
                .collect(),
            properties: self
                .properties
                .iter()
                .map(|p| FieldDump {
                    name: p.name.clone(),
                    type_name: p.type_name.clone(),
                    is_static: false,
                })
                .collect(),
            methods: self.methods.iter().map(MethodDef::dump).collect(),
            constructors,
            events: self
                .events
                .iter()
                .map(|e| EventDump {
                    name: e.name.clone(),
                    argument_types: e.argument_types.clone(),
                })
                .collect(),
            element_type: self.element_type.clone(),
        }
    }
}

/// Fluent definition of a type
pub struct TypeBuilder {
    def: TypeDef,
}

impl TypeBuilder {
    pub fn new(assembly: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            def: TypeDef {
                assembly: assembly.into(),
                full_name: full_name.into(),
                base: None,
                fields: Vec::new(),
                static_values: Vec::new(),
                properties: Vec::new(),
                methods: Vec::new(),
                constructors: Vec::new(),
                events: Vec::new(),
                element_type: None,
            },
        }
    }

    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.def.base = Some(base.into());
        self
    }

    pub fn field(mut self, name: &str, type_name: &str) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
            is_static: false,
        });
        self
    }

    pub fn static_field(mut self, name: &str, type_name: &str, initial: Value) -> Self {
        self.def.fields.push(FieldDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
            is_static: true,
        });
        self.def.static_values.push((name.to_string(), initial));
        self
    }

    pub fn property<F>(mut self, name: &str, type_name: &str, getter: F) -> Self
    where
        F: Fn(&SimRuntime, &ObjectRef) -> Result<Value> + Send + Sync + 'static,
    {
        self.def.properties.push(PropertyDef {
            name: name.to_string(),
            type_name: type_name.to_string(),
            getter: Arc::new(getter),
        });
        self
    }

    pub fn method<F>(self, name: &str, return_type: &str, params: &[(&str, &str)], body: F) -> Self
    where
        F: Fn(&SimRuntime, &CallFrame) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.push_method(name, return_type, &[], params, false, Arc::new(body))
    }

    pub fn static_method<F>(
        self,
        name: &str,
        return_type: &str,
        params: &[(&str, &str)],
        body: F,
    ) -> Self
    where
        F: Fn(&SimRuntime, &CallFrame) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.push_method(name, return_type, &[], params, true, Arc::new(body))
    }

    pub fn generic_method<F>(
        self,
        name: &str,
        return_type: &str,
        generic_params: &[&str],
        params: &[(&str, &str)],
        body: F,
    ) -> Self
    where
        F: Fn(&SimRuntime, &CallFrame) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.push_method(name, return_type, generic_params, params, false, Arc::new(body))
    }

    pub fn constructor<F>(mut self, params: &[(&str, &str)], body: F) -> Self
    where
        F: Fn(&SimRuntime, &CallFrame) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.def.constructors.push(MethodDef {
            name: CONSTRUCTOR_NAME.to_string(),
            return_type: "void".to_string(),
            params: owned_params(params),
            generic_params: Vec::new(),
            is_static: false,
            body: Arc::new(body),
        });
        self
    }

    pub fn event(mut self, name: &str, argument_types: &[&str]) -> Self {
        self.def.events.push(EventDef {
            name: name.to_string(),
            argument_types: argument_types.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Make this a list type with `Add`, `Clear` and `Count`
    pub fn collection_of(mut self, element_type: &str) -> Self {
        self.def.element_type = Some(element_type.to_string());
        self.method("Add", "void", &[("item", element_type)], |rt, frame| {
            rt.push_item(frame.this()?.id, frame.arg(0)?.clone())?;
            Ok(None)
        })
        .method("Clear", "void", &[], |rt, frame| {
            rt.clear_items(frame.this()?.id)?;
            Ok(None)
        })
        .property("Count", "int", |rt, this| {
            Ok(Value::from(rt.enumerate_collection(this.id)?.len() as i64))
        })
    }

    fn push_method(
        mut self,
        name: &str,
        return_type: &str,
        generic_params: &[&str],
        params: &[(&str, &str)],
        is_static: bool,
        body: NativeMethod,
    ) -> Self {
        self.def.methods.push(MethodDef {
            name: name.to_string(),
            return_type: return_type.to_string(),
            params: owned_params(params),
            generic_params: generic_params.iter().map(|s| s.to_string()).collect(),
            is_static,
            body,
        });
        self
    }
}

fn owned_params(params: &[(&str, &str)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(name, ty)| (name.to_string(), ty.to_string()))
        .collect()
}

#[derive(Default)]
struct TypeTable {
    types: HashMap<String, Arc<TypeDef>>,
    assemblies: BTreeMap<String, Vec<String>>,
}

impl TypeTable {
    fn get(&self, name: &str) -> Result<Arc<TypeDef>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Type not found: {}", name)))
    }

    /// The type followed by its base types
    fn chain(&self, name: &str) -> Vec<Arc<TypeDef>> {
        let mut chain = Vec::new();
        let mut next = self.types.get(name).cloned();
        while let Some(ty) = next {
            if chain.iter().any(|t: &Arc<TypeDef>| t.full_name == ty.full_name) {
                break;
            }
            next = ty.base_name().and_then(|b| self.types.get(&b).cloned());
            chain.push(ty);
        }
        chain
    }

    fn is_assignable(&self, actual: &str, expected: &str) -> bool {
        if actual == expected || expected == OBJECT_TYPE || expected == "object" {
            return true;
        }
        self.chain(actual).iter().any(|t| t.full_name == expected)
    }

    fn instance_fields(&self, name: &str) -> Vec<FieldDef> {
        self.chain(name)
            .iter()
            .flat_map(|t| t.fields.iter().filter(|f| !f.is_static).cloned())
            .collect()
    }

    fn find_field(&self, name: &str, field: &str) -> Option<(String, FieldDef)> {
        self.chain(name).iter().find_map(|t| {
            t.fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| (t.full_name.clone(), f.clone()))
        })
    }

    fn find_property(&self, name: &str, property: &str) -> Option<PropertyDef> {
        self.chain(name)
            .iter()
            .find_map(|t| t.properties.iter().find(|p| p.name == property).cloned())
    }

    fn has_event(&self, name: &str, event: &str) -> bool {
        self.chain(name)
            .iter()
            .any(|t| t.events.iter().any(|e| e.name == event))
    }

    /// Methods visible on a type; derived definitions hide base ones with
    /// the same signature
    fn methods_named(&self, name: &str, method: &str) -> Vec<(String, MethodDef)> {
        let mut found: Vec<(String, MethodDef)> = Vec::new();
        for ty in self.chain(name) {
            let defs = if method == CONSTRUCTOR_NAME {
                if ty.full_name != name {
                    break;
                }
                &ty.constructors
            } else {
                &ty.methods
            };
            for def in defs.iter().filter(|m| m.name == method) {
                let params = def.param_types();
                if !found.iter().any(|(_, m)| m.param_types() == params) {
                    found.push((ty.full_name.clone(), def.clone()));
                }
            }
        }
        found
    }

    /// Convert `value` for a slot of type `expected`, or `None` if it does not fit
    fn coerce(&self, value: &Value, expected: &str) -> Option<Value> {
        if expected == OBJECT_TYPE || expected == "object" {
            return Some(value.clone());
        }
        match value {
            Value::Null => {
                (expected == "string" || !PRIMITIVE_TYPES.contains(&expected)).then_some(Value::Null)
            }
            Value::Object(obj) => self
                .is_assignable(&obj.type_name, expected)
                .then(|| value.clone()),
            Value::Primitive(p) => coerce_primitive(p, expected).map(Value::Primitive),
        }
    }

    fn select_overload(
        &self,
        candidates: Vec<(String, MethodDef)>,
        args: &[Value],
    ) -> Option<(String, MethodDef, Vec<Value>)> {
        candidates.into_iter().find_map(|(declaring, def)| {
            if def.params.len() != args.len() {
                return None;
            }
            let coerced: Option<Vec<Value>> = args
                .iter()
                .zip(def.params.iter())
                .map(|(arg, (_, ty))| self.coerce(arg, ty))
                .collect();
            coerced.map(|args| (declaring, def, args))
        })
    }
}

fn coerce_primitive(p: &Primitive, expected: &str) -> Option<Primitive> {
    match (p, expected) {
        (p, ty) if p.type_name() == ty => Some(p.clone()),
        (Primitive::Int(v), "uint") => u64::try_from(*v).ok().map(Primitive::UInt),
        (Primitive::UInt(v), "int") => i64::try_from(*v).ok().map(Primitive::Int),
        (Primitive::Int(v), "float") => Some(Primitive::Float(*v as f64)),
        (Primitive::UInt(v), "float") => Some(Primitive::Float(*v as f64)),
        _ => None,
    }
}

fn default_value(type_name: &str) -> Slot {
    match type_name {
        "bool" => Slot::Primitive(Primitive::Bool(false)),
        "int" => Slot::Primitive(Primitive::Int(0)),
        "uint" => Slot::Primitive(Primitive::UInt(0)),
        "float" => Slot::Primitive(Primitive::Float(0.0)),
        "char" => Slot::Primitive(Primitive::Char('\0')),
        _ => Slot::Null,
    }
}

fn error_message(err: &Error) -> String {
    match err {
        Error::Target { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Append the failing frame to a target error's stack trace
fn with_frame(err: Error, declaring: &str, def: &MethodDef) -> Error {
    let frame = format!(
        "   at {}.{}({})",
        declaring,
        def.name,
        def.param_types().join(", ")
    );
    match err {
        Error::Target {
            message,
            stack_trace,
        } => Error::Target {
            message,
            stack_trace: Some(match stack_trace {
                Some(trace) => format!("{}\n{}", trace, frame),
                None => frame,
            }),
        },
        other => other,
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Stored form of a value; objects are held by identity so relocation
/// never leaves a stale address behind
#[derive(Debug, Clone)]
enum Slot {
    Null,
    Primitive(Primitive),
    Object(ObjectId),
}

impl From<&Value> for Slot {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Slot::Null,
            Value::Primitive(p) => Slot::Primitive(p.clone()),
            Value::Object(obj) => Slot::Object(obj.id),
        }
    }
}

struct SimObject {
    id: ObjectId,
    type_name: String,
    address: u64,
    fields: HashMap<String, Slot>,
    items: Vec<Slot>,
    listeners: HashMap<String, Vec<(ListenerId, EventListener)>>,
    pins: u32,
}

impl SimObject {
    fn as_ref(&self) -> ObjectRef {
        ObjectRef {
            id: self.id,
            address: self.address,
            type_name: self.type_name.clone(),
        }
    }
}

struct HeapState {
    objects: HashMap<ObjectId, SimObject>,
    by_address: BTreeMap<u64, ObjectId>,
    statics: HashMap<(String, String), Slot>,
    roots: HashSet<ObjectId>,
    next_id: u64,
    next_address: u64,
}

impl HeapState {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
            by_address: BTreeMap::new(),
            statics: HashMap::new(),
            roots: HashSet::new(),
            next_id: 1,
            next_address: HEAP_BASE,
        }
    }

    fn value_of(&self, slot: &Slot) -> Value {
        match slot {
            Slot::Null => Value::Null,
            Slot::Primitive(p) => Value::Primitive(p.clone()),
            Slot::Object(id) => self
                .objects
                .get(id)
                .map(|o| Value::Object(o.as_ref()))
                .unwrap_or(Value::Null),
        }
    }

    fn object(&self, id: ObjectId) -> Result<&SimObject> {
        self.objects
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("Object {} no longer exists", id.0)))
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut SimObject> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Object {} no longer exists", id.0)))
    }

    /// Objects reachable from statics, runtime roots and pins
    fn mark(&self) -> HashSet<ObjectId> {
        let mut stack: Vec<ObjectId> = self.roots.iter().copied().collect();
        stack.extend(self.objects.values().filter(|o| o.pins > 0).map(|o| o.id));
        stack.extend(self.statics.values().filter_map(|s| match s {
            Slot::Object(id) => Some(*id),
            _ => None,
        }));

        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            let Some(obj) = self.objects.get(&id) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            for slot in obj.fields.values().chain(obj.items.iter()) {
                if let Slot::Object(child) = slot {
                    if !seen.contains(child) {
                        stack.push(*child);
                    }
                }
            }
        }
        seen
    }

    fn move_object(&mut self, id: ObjectId, address: u64) {
        if let Some(obj) = self.objects.get_mut(&id) {
            if self.by_address.get(&obj.address) == Some(&id) {
                self.by_address.remove(&obj.address);
            }
            obj.address = address;
            self.by_address.insert(address, id);
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
struct MethodKey {
    declaring_type: String,
    name: String,
    params: Vec<String>,
}

#[derive(Clone)]
struct InstalledHook {
    key: MethodKey,
    position: HookPosition,
    callback: HookCallback,
}

// =============================================================================
// Runtime
// =============================================================================

pub struct SimRuntime {
    types: RwLock<TypeTable>,
    heap: RwLock<HeapState>,
    hooks: RwLock<BTreeMap<u64, InstalledHook>>,
    next_hook: AtomicU64,
    next_listener: AtomicU64,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuntime {
    pub fn new() -> Self {
        let runtime = Self {
            types: RwLock::new(TypeTable::default()),
            heap: RwLock::new(HeapState::new()),
            hooks: RwLock::new(BTreeMap::new()),
            next_hook: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        };
        runtime.define_type(
            TypeBuilder::new(CORE_ASSEMBLY, OBJECT_TYPE)
                .method("ToString", "string", &[], |_, frame| {
                    Ok(Some(Value::from(frame.this()?.type_name.clone())))
                })
                .method("GetHashCode", "int", &[], |_, frame| {
                    Ok(Some(Value::from(frame.this()?.id.0 as i64)))
                }),
        );
        runtime
    }

    /// Load a type. Redefining a name replaces the previous definition.
    pub fn define_type(&self, builder: TypeBuilder) {
        let def = builder.def;
        {
            let mut heap = self.heap.write();
            for (field, initial) in &def.static_values {
                heap.statics
                    .insert((def.full_name.clone(), field.clone()), Slot::from(initial));
            }
        }
        let mut types = self.types.write();
        let names = types.assemblies.entry(def.assembly.clone()).or_default();
        if !names.contains(&def.full_name) {
            names.push(def.full_name.clone());
        }
        debug!(target: "diver_agent::sim", type_name = %def.full_name, "Type defined");
        types.types.insert(def.full_name.clone(), Arc::new(def));
    }

    /// Target-side exception
    pub fn throw(message: impl Into<String>) -> Error {
        Error::target(message)
    }

    /// Allocate with default field values and run the matching constructor
    pub fn new_object(&self, type_name: &str) -> Result<ObjectRef> {
        self.create_object(type_name, Vec::new())
    }

    pub fn add_root(&self, id: ObjectId) {
        self.heap.write().roots.insert(id);
    }

    pub fn remove_root(&self, id: ObjectId) {
        self.heap.write().roots.remove(&id);
    }

    pub fn push_item(&self, id: ObjectId, value: Value) -> Result<()> {
        let element_type = self.element_type_of(id)?;
        let value = self.types.read().coerce(&value, &element_type).ok_or_else(|| {
            Error::target(format!("Cannot add value to a collection of {}", element_type))
        })?;
        self.heap.write().object_mut(id)?.items.push(Slot::from(&value));
        Ok(())
    }

    pub fn clear_items(&self, id: ObjectId) -> Result<()> {
        self.element_type_of(id)?;
        self.heap.write().object_mut(id)?.items.clear();
        Ok(())
    }

    /// Fire an event on an object; returns the number of listeners called
    pub fn raise_event(&self, id: ObjectId, event: &str, args: &[Value]) -> Result<usize> {
        let type_name = self.live_ref(id)?.type_name;
        if !self.types.read().has_event(&type_name, event) {
            return Err(Error::target(format!("{} has no event {}", type_name, event)));
        }
        let listeners: Vec<EventListener> = self
            .heap
            .read()
            .object(id)?
            .listeners
            .get(event)
            .map(|ls| ls.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        trace!(
            target: "diver_agent::sim",
            object = id.0,
            event,
            listeners = listeners.len(),
            "Raising event"
        );
        for listener in &listeners {
            listener(args);
        }
        Ok(listeners.len())
    }

    /// Free every object not reachable from a root; returns how many were freed
    pub fn collect(&self) -> usize {
        let mut heap = self.heap.write();
        let live = heap.mark();
        let dead: Vec<ObjectId> = heap
            .objects
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in &dead {
            if let Some(obj) = heap.objects.remove(id) {
                heap.by_address.remove(&obj.address);
            }
        }
        debug!(target: "diver_agent::sim", freed = dead.len(), "Collection finished");
        dead.len()
    }

    /// Slide unpinned objects down to the lowest free addresses; returns how
    /// many moved. Freed addresses are reused by whatever slides into them.
    pub fn compact(&self) -> usize {
        let mut heap = self.heap.write();
        let pinned: HashSet<u64> = heap
            .objects
            .values()
            .filter(|o| o.pins > 0)
            .map(|o| o.address)
            .collect();
        let mut movable: Vec<(u64, ObjectId)> = heap
            .objects
            .values()
            .filter(|o| o.pins == 0)
            .map(|o| (o.address, o.id))
            .collect();
        movable.sort();

        let mut next = HEAP_BASE;
        let mut moved = 0;
        for (old, id) in movable {
            while pinned.contains(&next) {
                next += OBJECT_STRIDE;
            }
            if next != old {
                heap.move_object(id, next);
                moved += 1;
            }
            next += OBJECT_STRIDE;
        }
        let top_pinned = pinned.iter().max().map(|a| a + OBJECT_STRIDE).unwrap_or(HEAP_BASE);
        heap.next_address = next.max(top_pinned);
        debug!(target: "diver_agent::sim", moved, "Compaction finished");
        moved
    }

    /// Move one object to a fresh address, pinned or not
    pub fn relocate(&self, id: ObjectId) -> Result<u64> {
        let mut heap = self.heap.write();
        heap.object(id)?;
        let address = heap.next_address;
        heap.next_address += OBJECT_STRIDE;
        heap.move_object(id, address);
        Ok(address)
    }

    /// Remove an object regardless of roots and pins
    pub fn destroy(&self, id: ObjectId) -> bool {
        let mut heap = self.heap.write();
        heap.roots.remove(&id);
        match heap.objects.remove(&id) {
            Some(obj) => {
                if heap.by_address.get(&obj.address) == Some(&id) {
                    heap.by_address.remove(&obj.address);
                }
                true
            }
            None => false,
        }
    }

    pub fn object_count(&self) -> usize {
        self.heap.read().objects.len()
    }

    pub fn pin_count(&self, id: ObjectId) -> u32 {
        self.heap.read().objects.get(&id).map(|o| o.pins).unwrap_or(0)
    }

    fn live_ref(&self, id: ObjectId) -> Result<ObjectRef> {
        Ok(self.heap.read().object(id)?.as_ref())
    }

    fn element_type_of(&self, id: ObjectId) -> Result<String> {
        let type_name = self.live_ref(id)?.type_name;
        let types = self.types.read();
        types
            .chain(&type_name)
            .iter()
            .find_map(|t| t.element_type.clone())
            .ok_or_else(|| Error::target(format!("{} is not a collection", type_name)))
    }

    fn allocate(&self, type_name: &str, fields: Vec<FieldDef>) -> ObjectRef {
        let mut heap = self.heap.write();
        let id = ObjectId(heap.next_id);
        heap.next_id += 1;
        let address = heap.next_address;
        heap.next_address += OBJECT_STRIDE;

        let obj = SimObject {
            id,
            type_name: type_name.to_string(),
            address,
            fields: fields
                .iter()
                .map(|f| (f.name.clone(), default_value(&f.type_name)))
                .collect(),
            items: Vec::new(),
            listeners: HashMap::new(),
            pins: 0,
        };
        let object = obj.as_ref();
        heap.by_address.insert(address, id);
        heap.objects.insert(id, obj);
        trace!(target: "diver_agent::sim", object = %object.object_address(), "Allocated");
        object
    }

    /// Run a resolved method with its hooks around it
    fn run_method(
        &self,
        declaring: &str,
        def: &MethodDef,
        this: Option<ObjectRef>,
        args: Vec<Value>,
        generic_args: Vec<String>,
    ) -> Result<Option<Value>> {
        let key = MethodKey {
            declaring_type: declaring.to_string(),
            name: def.name.clone(),
            params: def.param_types(),
        };
        let hooks: Vec<InstalledHook> = self
            .hooks
            .read()
            .values()
            .filter(|h| h.key == key)
            .cloned()
            .collect();

        let fire = |position: HookPosition, return_value: Option<Value>, error: Option<String>| {
            let mut context: Option<HookContext> = None;
            for hook in hooks.iter().filter(|h| h.position == position) {
                let ctx = context.get_or_insert_with(|| HookContext {
                    position,
                    type_full_name: declaring.to_string(),
                    method_name: def.name.clone(),
                    instance: this.clone(),
                    args: args.clone(),
                    return_value: return_value.clone(),
                    error: error.clone(),
                });
                (hook.callback)(ctx);
            }
        };

        fire(HookPosition::Pre, None, None);

        let frame = CallFrame {
            this: this.clone(),
            args: args.clone(),
            generic_args,
        };
        let result = (def.body)(self, &frame)
            .map(|value| {
                if def.is_void() {
                    None
                } else {
                    Some(value.unwrap_or(Value::Null))
                }
            })
            .map_err(|e| with_frame(e, declaring, def));

        match &result {
            Ok(value) => {
                fire(HookPosition::Post, value.clone(), None);
                fire(HookPosition::Finalizer, value.clone(), None);
            }
            Err(e) => fire(HookPosition::Finalizer, None, Some(error_message(e))),
        }
        result
    }

    fn resolve_hook_target(&self, target: &MethodTarget) -> Result<MethodKey> {
        let types = self.types.read();
        types.get(&target.type_full_name)?;
        let candidates = types.methods_named(&target.type_full_name, &target.method_name);
        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "Method {}.{} not found",
                target.type_full_name, target.method_name
            )));
        }

        let chosen = if !target.parameter_types.is_empty() {
            candidates
                .iter()
                .find(|(_, m)| m.param_types() == target.parameter_types)
        } else if candidates.len() == 1 {
            candidates.first()
        } else {
            candidates.iter().find(|(_, m)| m.params.is_empty())
        };

        match chosen {
            Some((declaring, def)) => Ok(MethodKey {
                declaring_type: declaring.clone(),
                name: def.name.clone(),
                params: def.param_types(),
            }),
            None if target.parameter_types.is_empty() => Err(Error::target(format!(
                "{}.{} is overloaded; specify parameter types",
                target.type_full_name, target.method_name
            ))),
            None => Err(Error::NotFound(format!(
                "No overload {}.{}({})",
                target.type_full_name,
                target.method_name,
                target.parameter_types.join(", ")
            ))),
        }
    }
}

impl ManagedRuntime for SimRuntime {
    fn assemblies(&self) -> Vec<String> {
        self.types.read().assemblies.keys().cloned().collect()
    }

    fn types_in(&self, assembly: &str) -> Result<Vec<String>> {
        self.types
            .read()
            .assemblies
            .get(assembly)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Assembly not found: {}", assembly)))
    }

    fn dump_type(&self, assembly: Option<&str>, type_name: &str) -> Result<TypeDump> {
        let ty = self.types.read().get(type_name)?;
        if let Some(assembly) = assembly {
            if ty.assembly != assembly {
                return Err(Error::NotFound(format!(
                    "Type {} not found in assembly {}",
                    type_name, assembly
                )));
            }
        }
        Ok(ty.dump())
    }

    fn is_assignable(&self, actual: &str, expected: &str) -> bool {
        self.types.read().is_assignable(actual, expected)
    }

    fn object_at(&self, address: u64) -> Option<HeapObject> {
        let heap = self.heap.read();
        let id = heap.by_address.get(&address)?;
        let obj = heap.objects.get(id)?;
        let reachable = heap.mark().contains(id);
        Some(HeapObject {
            object: obj.as_ref(),
            reachable,
        })
    }

    fn locate(&self, id: ObjectId) -> Option<HeapObject> {
        let heap = self.heap.read();
        let obj = heap.objects.get(&id)?;
        Some(HeapObject {
            object: obj.as_ref(),
            reachable: heap.mark().contains(&id),
        })
    }

    fn enumerate_instances(&self, filter: &dyn Fn(&str) -> bool) -> Vec<HeapObject> {
        let heap = self.heap.read();
        let live = heap.mark();
        heap.by_address
            .values()
            .filter_map(|id| heap.objects.get(id))
            .filter(|o| filter(&o.type_name))
            .map(|o| HeapObject {
                object: o.as_ref(),
                reachable: live.contains(&o.id),
            })
            .collect()
    }

    fn pin(&self, id: ObjectId) -> Result<()> {
        self.heap.write().object_mut(id)?.pins += 1;
        Ok(())
    }

    fn unpin(&self, id: ObjectId) {
        if let Some(obj) = self.heap.write().objects.get_mut(&id) {
            obj.pins = obj.pins.saturating_sub(1);
        }
    }

    fn get_field(&self, target: Option<ObjectId>, type_name: &str, field: &str) -> Result<Value> {
        let types = self.types.read();
        match target {
            Some(id) => {
                let actual = self.live_ref(id)?;
                if !types.is_assignable(&actual.type_name, type_name) {
                    return Err(Error::target(format!(
                        "Object of type {} is not a {}",
                        actual.type_name, type_name
                    )));
                }
                if let Some((declaring, def)) = types.find_field(&actual.type_name, field) {
                    let heap = self.heap.read();
                    let slot = if def.is_static {
                        heap.statics.get(&(declaring, def.name))
                    } else {
                        heap.object(id)?.fields.get(field)
                    };
                    return Ok(slot.map(|s| heap.value_of(s)).unwrap_or(Value::Null));
                }
                let property = types.find_property(&actual.type_name, field);
                drop(types);
                match property {
                    Some(prop) => (prop.getter)(self, &actual),
                    None => Err(Error::NotFound(format!(
                        "Member {} not found on {}",
                        field, actual.type_name
                    ))),
                }
            }
            None => {
                types.get(type_name)?;
                match types.find_field(type_name, field) {
                    Some((declaring, def)) if def.is_static => {
                        let heap = self.heap.read();
                        Ok(heap
                            .statics
                            .get(&(declaring, def.name))
                            .map(|s| heap.value_of(s))
                            .unwrap_or(Value::Null))
                    }
                    Some(_) => Err(Error::target(format!(
                        "Field {}.{} is an instance field",
                        type_name, field
                    ))),
                    None => Err(Error::NotFound(format!(
                        "Static field {}.{} not found",
                        type_name, field
                    ))),
                }
            }
        }
    }

    fn set_field(
        &self,
        target: Option<ObjectId>,
        type_name: &str,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let types = self.types.read();
        let owner = match target {
            Some(id) => self.live_ref(id)?.type_name,
            None => {
                types.get(type_name)?;
                type_name.to_string()
            }
        };
        if !types.is_assignable(&owner, type_name) {
            return Err(Error::target(format!(
                "Object of type {} is not a {}",
                owner, type_name
            )));
        }

        let Some((declaring, def)) = types.find_field(&owner, field) else {
            if types.find_property(&owner, field).is_some() {
                return Err(Error::target(format!("Property {} is read-only", field)));
            }
            return Err(Error::NotFound(format!(
                "Field {} not found on {}",
                field, owner
            )));
        };
        let value = types.coerce(&value, &def.type_name).ok_or_else(|| {
            Error::target(format!(
                "Cannot assign value to field {} of type {}",
                field, def.type_name
            ))
        })?;

        let mut heap = self.heap.write();
        match (target, def.is_static) {
            (_, true) => {
                heap.statics.insert((declaring, def.name), Slot::from(&value));
            }
            (Some(id), false) => {
                heap.object_mut(id)?
                    .fields
                    .insert(def.name, Slot::from(&value));
            }
            (None, false) => {
                return Err(Error::target(format!(
                    "Field {}.{} is an instance field",
                    type_name, field
                )))
            }
        }
        Ok(())
    }

    fn invoke(
        &self,
        target: Option<ObjectId>,
        type_name: &str,
        method: &str,
        generic_args: &[String],
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let this = match target {
            Some(id) => Some(self.live_ref(id)?),
            None => None,
        };

        let (declaring, def, args) = {
            let types = self.types.read();
            let lookup = match &this {
                Some(obj) => {
                    if !types.is_assignable(&obj.type_name, type_name) {
                        return Err(Error::target(format!(
                            "Object of type {} is not a {}",
                            obj.type_name, type_name
                        )));
                    }
                    obj.type_name.clone()
                }
                None => {
                    types.get(type_name)?;
                    type_name.to_string()
                }
            };

            let candidates: Vec<(String, MethodDef)> = types
                .methods_named(&lookup, method)
                .into_iter()
                .filter(|(_, m)| m.is_static == this.is_none())
                .collect();
            if candidates.is_empty() {
                return Err(Error::NotFound(format!(
                    "Method {}.{} not found",
                    type_name, method
                )));
            }
            types.select_overload(candidates, &args).ok_or_else(|| {
                Error::target(format!(
                    "No overload of {}.{} accepts the given {} argument(s)",
                    type_name,
                    method,
                    args.len()
                ))
            })?
        };

        if def.generic_params.len() != generic_args.len() {
            return Err(Error::target(format!(
                "{}.{} expects {} generic argument(s), got {}",
                declaring,
                method,
                def.generic_params.len(),
                generic_args.len()
            )));
        }

        self.run_method(&declaring, &def, this, args, generic_args.to_vec())
    }

    fn create_object(&self, type_name: &str, args: Vec<Value>) -> Result<ObjectRef> {
        let (fields, ctor) = {
            let types = self.types.read();
            let ty = types.get(type_name)?;
            let ctor = if ty.constructors.is_empty() {
                if !args.is_empty() {
                    return Err(Error::target(format!(
                        "{} has no constructor taking {} argument(s)",
                        type_name,
                        args.len()
                    )));
                }
                None
            } else {
                let candidates = types.methods_named(type_name, CONSTRUCTOR_NAME);
                Some(types.select_overload(candidates, &args).ok_or_else(|| {
                    Error::target(format!(
                        "{} has no constructor taking the given {} argument(s)",
                        type_name,
                        args.len()
                    ))
                })?)
            };
            (types.instance_fields(type_name), ctor)
        };

        let object = self.allocate(type_name, fields);
        if let Some((declaring, def, args)) = ctor {
            if let Err(e) = self.run_method(&declaring, &def, Some(object.clone()), args, Vec::new())
            {
                self.destroy(object.id);
                return Err(e);
            }
        }
        self.live_ref(object.id)
    }

    fn subscribe_event(
        &self,
        target: ObjectId,
        event: &str,
        listener: EventListener,
    ) -> Result<ListenerId> {
        let type_name = self.live_ref(target)?.type_name;
        if !self.types.read().has_event(&type_name, event) {
            return Err(Error::NotFound(format!(
                "Event {} not found on {}",
                event, type_name
            )));
        }
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.heap
            .write()
            .object_mut(target)?
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    fn unsubscribe_event(&self, target: ObjectId, event: &str, listener: ListenerId) -> Result<()> {
        let mut heap = self.heap.write();
        let obj = heap.object_mut(target)?;
        let listeners = obj.listeners.entry(event.to_string()).or_default();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener);
        if listeners.len() == before {
            return Err(Error::NotFound(format!(
                "Listener {} not attached to {}",
                listener.0, event
            )));
        }
        Ok(())
    }

    fn install_hook(
        &self,
        target: &MethodTarget,
        position: HookPosition,
        callback: HookCallback,
    ) -> Result<HookId> {
        let key = self.resolve_hook_target(target)?;
        let id = self.next_hook.fetch_add(1, Ordering::SeqCst);
        debug!(
            target: "diver_agent::sim",
            hook = id,
            method = %format!("{}.{}", key.declaring_type, key.name),
            %position,
            "Hook installed"
        );
        self.hooks.write().insert(
            id,
            InstalledHook {
                key,
                position,
                callback,
            },
        );
        Ok(HookId(id))
    }

    fn remove_hook(&self, id: HookId) -> Result<()> {
        self.hooks
            .write()
            .remove(&id.0)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Hook {} not installed", id.0)))
    }

    fn enumerate_collection(&self, target: ObjectId) -> Result<Vec<Value>> {
        self.element_type_of(target)?;
        let heap = self.heap.read();
        Ok(heap
            .object(target)?
            .items
            .iter()
            .map(|s| heap.value_of(s))
            .collect())
    }

    fn element_at(&self, target: ObjectId, index: usize) -> Result<Value> {
        let items = self.enumerate_collection(target)?;
        let len = items.len();
        items.into_iter().nth(index).ok_or_else(|| {
            Error::target(format!(
                "Index {} is out of range for a collection of {} element(s)",
                index, len
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn runtime() -> SimRuntime {
        let rt = SimRuntime::new();
        rt.define_type(
            TypeBuilder::new("Demo", "Demo.Entity")
                .field("Name", "string")
                .method("Describe", "string", &[], |rt, frame| {
                    let name = rt.get_field(Some(frame.this()?.id), "Demo.Entity", "Name")?;
                    Ok(Some(Value::from(format!("entity {:?}", name))))
                }),
        );
        rt.define_type(
            TypeBuilder::new("Demo", "Demo.Player")
                .base("Demo.Entity")
                .field("Health", "int")
                .event("Damaged", &["int"])
                .constructor(&[("health", "int")], |rt, frame| {
                    let health = frame.arg(0)?.clone();
                    rt.set_field(Some(frame.this()?.id), "Demo.Player", "Health", health)?;
                    Ok(None)
                })
                .constructor(&[], |_, _| Ok(None))
                .method("TakeDamage", "void", &[("amount", "int")], |rt, frame| {
                    let this = frame.this()?;
                    let amount = frame.int_arg(0)?;
                    if amount < 0 {
                        return Err(SimRuntime::throw("Damage must be positive"));
                    }
                    let health = rt
                        .get_field(Some(this.id), "Demo.Player", "Health")?
                        .as_primitive()
                        .and_then(Primitive::as_i64)
                        .unwrap_or(0);
                    rt.set_field(
                        Some(this.id),
                        "Demo.Player",
                        "Health",
                        Value::from(health - amount),
                    )?;
                    rt.raise_event(this.id, "Damaged", &[Value::from(amount)])?;
                    Ok(None)
                })
                .static_method("Add", "int", &[("a", "int"), ("b", "int")], |_, frame| {
                    Ok(Some(Value::from(frame.int_arg(0)? + frame.int_arg(1)?)))
                })
                .generic_method("Echo", "string", &["T"], &[("value", "object")], |_, frame| {
                    Ok(Some(Value::from(frame.generic_args.join(","))))
                }),
        );
        rt.define_type(TypeBuilder::new("Demo", "Demo.Party").collection_of("Demo.Player"));
        rt
    }

    #[test]
    fn test_field_defaults_and_constructor() {
        let rt = runtime();
        let p = rt.create_object("Demo.Player", vec![Value::from(50)]).unwrap();
        assert_eq!(
            rt.get_field(Some(p.id), "Demo.Player", "Health").unwrap(),
            Value::from(50i64)
        );
        // inherited field defaults to null
        assert_eq!(
            rt.get_field(Some(p.id), "Demo.Entity", "Name").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_invoke_inherited_and_object_methods() {
        let rt = runtime();
        let p = rt.new_object("Demo.Player").unwrap();
        let text = rt
            .invoke(Some(p.id), "Demo.Player", "ToString", &[], vec![])
            .unwrap();
        assert_eq!(text, Some(Value::from("Demo.Player")));
        let void = rt
            .invoke(Some(p.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(3)])
            .unwrap();
        assert_eq!(void, None);
    }

    #[test]
    fn test_throwing_method_carries_stack_trace() {
        let rt = runtime();
        let p = rt.new_object("Demo.Player").unwrap();
        let err = rt
            .invoke(Some(p.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(-1)])
            .unwrap_err();
        assert_eq!(error_message(&err), "Damage must be positive");
        assert!(err.stack_trace().unwrap().contains("Demo.Player.TakeDamage(int)"));
    }

    #[test]
    fn test_generic_argument_count_checked() {
        let rt = runtime();
        let p = rt.new_object("Demo.Player").unwrap();
        let ok = rt
            .invoke(
                Some(p.id),
                "Demo.Player",
                "Echo",
                &["int".to_string()],
                vec![Value::from(1)],
            )
            .unwrap();
        assert_eq!(ok, Some(Value::from("int")));
        assert!(rt
            .invoke(Some(p.id), "Demo.Player", "Echo", &[], vec![Value::from(1)])
            .is_err());
    }

    #[test]
    fn test_collect_respects_roots_and_pins() {
        let rt = runtime();
        let rooted = rt.new_object("Demo.Player").unwrap();
        let pinned = rt.new_object("Demo.Player").unwrap();
        let garbage = rt.new_object("Demo.Player").unwrap();
        rt.add_root(rooted.id);
        rt.pin(pinned.id).unwrap();

        assert!(!rt.object_at(garbage.address).unwrap().reachable);
        assert_eq!(rt.collect(), 1);
        assert!(rt.locate(garbage.id).is_none());
        assert!(rt.locate(rooted.id).is_some());
        assert!(rt.locate(pinned.id).is_some());
    }

    #[test]
    fn test_compaction_reuses_addresses() {
        let rt = runtime();
        let first = rt.new_object("Demo.Player").unwrap();
        let second = rt.new_object("Demo.Entity").unwrap();
        rt.add_root(second.id);
        rt.collect();
        assert_eq!(rt.compact(), 1);

        let moved = rt.locate(second.id).unwrap().object;
        assert_eq!(moved.address, first.address);
        assert_eq!(rt.object_at(first.address).unwrap().object.id, second.id);
    }

    #[test]
    fn test_compaction_leaves_pinned_objects() {
        let rt = runtime();
        let _gone = rt.new_object("Demo.Player").unwrap();
        let pinned = rt.new_object("Demo.Player").unwrap();
        rt.pin(pinned.id).unwrap();
        rt.collect();
        rt.compact();
        assert_eq!(rt.locate(pinned.id).unwrap().object.address, pinned.address);
    }

    #[test]
    fn test_object_fields_survive_relocation() {
        let rt = runtime();
        rt.define_type(TypeBuilder::new("Demo", "Demo.Holder").field("Target", "Demo.Player"));
        let holder = rt.new_object("Demo.Holder").unwrap();
        let player = rt.new_object("Demo.Player").unwrap();
        rt.set_field(
            Some(holder.id),
            "Demo.Holder",
            "Target",
            Value::Object(player.clone()),
        )
        .unwrap();
        let new_address = rt.relocate(player.id).unwrap();
        match rt.get_field(Some(holder.id), "Demo.Holder", "Target").unwrap() {
            Value::Object(obj) => {
                assert_eq!(obj.id, player.id);
                assert_eq!(obj.address, new_address);
            }
            other => panic!("Expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_hooks_fire_in_order_without_altering_result() {
        let rt = runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for position in [HookPosition::Pre, HookPosition::Post, HookPosition::Finalizer] {
            let seen = Arc::clone(&seen);
            rt.install_hook(
                &MethodTarget {
                    type_full_name: "Demo.Player".to_string(),
                    method_name: "Add".to_string(),
                    parameter_types: vec![],
                },
                position,
                Arc::new(move |ctx: &HookContext| {
                    seen.lock().push((ctx.position, ctx.args.clone(), ctx.return_value.clone()))
                }),
            )
            .unwrap();
        }
        let result = rt
            .invoke(None, "Demo.Player", "Add", &[], vec![Value::from(2), Value::from(3)])
            .unwrap();
        assert_eq!(result, Some(Value::from(5i64)));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, HookPosition::Pre);
        assert_eq!(seen[0].1, vec![Value::from(2i64), Value::from(3i64)]);
        assert_eq!(seen[0].2, None);
        assert_eq!(seen[1].2, Some(Value::from(5i64)));
        assert_eq!(seen[2].0, HookPosition::Finalizer);
    }

    #[test]
    fn test_finalizer_sees_error() {
        let rt = runtime();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        rt.install_hook(
            &MethodTarget {
                type_full_name: "Demo.Player".to_string(),
                method_name: "TakeDamage".to_string(),
                parameter_types: vec!["int".to_string()],
            },
            HookPosition::Finalizer,
            Arc::new(move |ctx: &HookContext| sink.lock().push(ctx.error.clone())),
        )
        .unwrap();
        let p = rt.new_object("Demo.Player").unwrap();
        let _ = rt.invoke(Some(p.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(-5)]);
        assert_eq!(
            errors.lock().as_slice(),
            &[Some("Damage must be positive".to_string())]
        );
    }

    #[test]
    fn test_removed_hook_stops_firing() {
        let rt = runtime();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let id = rt
            .install_hook(
                &MethodTarget {
                    type_full_name: "Demo.Player".to_string(),
                    method_name: "Add".to_string(),
                    parameter_types: vec![],
                },
                HookPosition::Pre,
                Arc::new(move |_: &HookContext| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let args = || vec![Value::from(1), Value::from(1)];
        rt.invoke(None, "Demo.Player", "Add", &[], args()).unwrap();
        rt.remove_hook(id).unwrap();
        rt.invoke(None, "Demo.Player", "Add", &[], args()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_and_collections() {
        let rt = runtime();
        let p = rt.create_object("Demo.Player", vec![Value::from(10)]).unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&hits);
        let listener = rt
            .subscribe_event(
                p.id,
                "Damaged",
                Arc::new(move |args: &[Value]| sink.lock().push(args.to_vec())),
            )
            .unwrap();
        rt.invoke(Some(p.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(4)])
            .unwrap();
        rt.unsubscribe_event(p.id, "Damaged", listener).unwrap();
        rt.invoke(Some(p.id), "Demo.Player", "TakeDamage", &[], vec![Value::from(1)])
            .unwrap();
        assert_eq!(hits.lock().len(), 1);
        assert!(rt.subscribe_event(p.id, "Healed", Arc::new(|_: &[Value]| {})).is_err());

        let party = rt.new_object("Demo.Party").unwrap();
        rt.invoke(Some(party.id), "Demo.Party", "Add", &[], vec![Value::Object(p.clone())])
            .unwrap();
        assert_eq!(
            rt.get_field(Some(party.id), "Demo.Party", "Count").unwrap(),
            Value::from(1i64)
        );
        assert_eq!(
            rt.element_at(party.id, 0).unwrap().as_object().map(|o| o.id),
            Some(p.id)
        );
        assert!(rt.element_at(party.id, 3).is_err());
    }

    #[test]
    fn test_dump_type() {
        let rt = runtime();
        let dump = rt.dump_type(Some("Demo"), "Demo.Player").unwrap();
        assert_eq!(dump.base_type.as_deref(), Some("Demo.Entity"));
        assert!(dump.has_member("TakeDamage"));
        assert!(dump.has_member("Damaged"));
        assert_eq!(dump.constructors.len(), 2);
        assert!(rt.dump_type(Some("Other"), "Demo.Player").is_err());
        assert!(rt.is_assignable("Demo.Player", "Demo.Entity"));
        assert!(!rt.is_assignable("Demo.Entity", "Demo.Player"));
    }

    #[test]
    fn test_overloaded_hook_target_needs_parameter_types() {
        let rt = runtime();
        rt.define_type(
            TypeBuilder::new("Demo", "Demo.Calc")
                .static_method("Sum", "int", &[("a", "int")], |_, f| Ok(Some(f.arg(0)?.clone())))
                .static_method("Sum", "int", &[("a", "int"), ("b", "int")], |_, f| {
                    Ok(Some(Value::from(f.int_arg(0)? + f.int_arg(1)?)))
                }),
        );
        let target = |params: &[&str]| MethodTarget {
            type_full_name: "Demo.Calc".to_string(),
            method_name: "Sum".to_string(),
            parameter_types: params.iter().map(|s| s.to_string()).collect(),
        };
        let noop: HookCallback = Arc::new(|_: &HookContext| {});
        assert!(rt
            .install_hook(&target(&[]), HookPosition::Pre, Arc::clone(&noop))
            .is_err());
        assert!(rt
            .install_hook(&target(&["int", "int"]), HookPosition::Pre, noop)
            .is_ok());
    }
}
