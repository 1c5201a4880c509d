//! Object registry
//!
//! Maps opaque handles to pinned objects. Every entry remembers the object's
//! identity and last known address; references are counted per owning
//! session, and the runtime pin is dropped when the last reference goes.
//! Event subscriptions hold references of their own, counted apart from any
//! session so a controller's release can never take them.

use crate::heap::HeapInspector;
use crate::runtime::{ObjectId, ObjectRef, Value};
use diver_common::{Error, HandleId, ObjectOrPrimitive, ProcessId, RemoteHandle, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RegistryEntry {
    object: ObjectRef,
    refs: HashMap<ProcessId, usize>,
    /// References held by live subscriptions
    retained: usize,
}

impl RegistryEntry {
    fn handle(&self, id: HandleId) -> RemoteHandle {
        RemoteHandle::new(id, self.object.address, self.object.type_name.clone())
    }

    fn total_refs(&self) -> usize {
        self.refs.values().sum::<usize>() + self.retained
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<HandleId, RegistryEntry>,
    by_identity: HashMap<ObjectId, HandleId>,
    next_handle: u64,
}

impl RegistryInner {
    fn remove(&mut self, handle: HandleId) -> Option<RegistryEntry> {
        let entry = self.entries.remove(&handle)?;
        self.by_identity.remove(&entry.object.id);
        Some(entry)
    }
}

pub struct ObjectRegistry {
    heap: Arc<HeapInspector>,
    inner: Mutex<RegistryInner>,
}

impl ObjectRegistry {
    pub fn new(heap: Arc<HeapInspector>) -> Self {
        Self {
            heap,
            inner: Mutex::new(RegistryInner {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Pin `object` for `owner`. An object already tracked keeps its handle
    /// and gains a reference.
    pub fn pin(&self, object: &ObjectRef, owner: ProcessId) -> Result<RemoteHandle> {
        let mut inner = self.inner.lock();
        if let Some(&handle) = inner.by_identity.get(&object.id) {
            if let Some(entry) = inner.entries.get_mut(&handle) {
                entry.object.address = object.address;
                *entry.refs.entry(owner).or_insert(0) += 1;
                return Ok(entry.handle(handle));
            }
        }

        self.heap.runtime().pin(object.id)?;
        let handle = HandleId(inner.next_handle);
        inner.next_handle += 1;
        let entry = RegistryEntry {
            object: object.clone(),
            refs: HashMap::from([(owner, 1)]),
            retained: 0,
        };
        let remote = entry.handle(handle);
        inner.by_identity.insert(object.id, handle);
        inner.entries.insert(handle, entry);

        debug!(
            target: "diver_agent::registry",
            %handle,
            object = %object.object_address(),
            owner,
            "Pinned object"
        );
        Ok(remote)
    }

    /// Validate a raw address and pin what lives there
    pub fn pin_address(
        &self,
        address: u64,
        type_name: &str,
        owner: ProcessId,
    ) -> Result<RemoteHandle> {
        let object = self.heap.validate(address, type_name)?;
        self.pin(&object, owner)
    }

    /// Current live object behind a handle.
    ///
    /// The recorded address is revalidated, including identity. A relocated
    /// object is re-acquired and its address updated; anything else is a
    /// stale reference.
    pub fn resolve(&self, handle: &RemoteHandle) -> Result<ObjectRef> {
        let recorded = {
            let inner = self.inner.lock();
            match inner.entries.get(&handle.handle) {
                Some(entry) => entry.object.clone(),
                None => return Err(Error::stale(handle.address, handle.type_name.clone())),
            }
        };

        if let Ok(object) =
            self.heap
                .validate_identity(recorded.address, &recorded.type_name, recorded.id)
        {
            return Ok(object);
        }

        let object = self
            .heap
            .reacquire(recorded.id, &recorded.type_name, recorded.address)
            .map_err(|e| {
                warn!(
                    target: "diver_agent::registry",
                    handle = %handle.handle,
                    object = %recorded.object_address(),
                    "Stale handle"
                );
                e
            })?;

        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&handle.handle) {
            if entry.object.id == object.id {
                entry.object.address = object.address;
            }
        }
        Ok(object)
    }

    /// Convert a wire value for the runtime, resolving handles
    pub fn import(&self, value: &ObjectOrPrimitive) -> Result<Value> {
        match value {
            ObjectOrPrimitive::Null => Ok(Value::Null),
            ObjectOrPrimitive::Primitive(p) => Ok(Value::Primitive(p.clone())),
            ObjectOrPrimitive::Remote(handle) => self.resolve(handle).map(Value::Object),
        }
    }

    pub fn add_ref(&self, handle: HandleId, owner: ProcessId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("Unknown handle {}", handle)))?;
        *entry.refs.entry(owner).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one of `owner`'s references. Returns true when the entry was freed.
    pub fn release(&self, handle: HandleId, owner: ProcessId) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&handle)
                .ok_or_else(|| Error::NotFound(format!("Unknown handle {}", handle)))?;
            let Some(count) = entry.refs.get_mut(&owner) else {
                return Err(Error::session(format!(
                    "Session {} holds no reference to {}",
                    owner, handle
                )));
            };
            *count -= 1;
            if *count == 0 {
                entry.refs.remove(&owner);
            }
            if entry.total_refs() == 0 {
                inner.remove(handle)
            } else {
                None
            }
        };

        match removed {
            Some(entry) => {
                self.heap.runtime().unpin(entry.object.id);
                debug!(target: "diver_agent::registry", %handle, "Released object");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Add a subscription reference
    pub fn retain(&self, handle: HandleId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&handle)
            .ok_or_else(|| Error::NotFound(format!("Unknown handle {}", handle)))?;
        entry.retained += 1;
        Ok(())
    }

    /// Drop a subscription reference. Returns true when the entry was freed.
    pub fn unretain(&self, handle: HandleId) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&handle)
                .ok_or_else(|| Error::NotFound(format!("Unknown handle {}", handle)))?;
            if entry.retained == 0 {
                return Err(Error::Internal(format!("{} has no subscription references", handle)));
            }
            entry.retained -= 1;
            if entry.total_refs() == 0 {
                inner.remove(handle)
            } else {
                None
            }
        };

        match removed {
            Some(entry) => {
                self.heap.runtime().unpin(entry.object.id);
                debug!(target: "diver_agent::registry", %handle, "Released object");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every reference `owner` holds; returns how many entries were freed
    pub fn release_all_for_session(&self, owner: ProcessId) -> usize {
        let freed: Vec<RegistryEntry> = {
            let mut inner = self.inner.lock();
            let mut empty = Vec::new();
            for (handle, entry) in inner.entries.iter_mut() {
                if entry.refs.remove(&owner).is_some() && entry.total_refs() == 0 {
                    empty.push(*handle);
                }
            }
            empty
                .into_iter()
                .filter_map(|handle| inner.remove(handle))
                .collect()
        };
        for entry in &freed {
            self.heap.runtime().unpin(entry.object.id);
        }
        if !freed.is_empty() {
            debug!(
                target: "diver_agent::registry",
                owner,
                freed = freed.len(),
                "Released session objects"
            );
        }
        freed.len()
    }

    /// Unpin everything
    pub fn clear(&self) -> usize {
        let entries: Vec<RegistryEntry> = {
            let mut inner = self.inner.lock();
            inner.by_identity.clear();
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            self.heap.runtime().unpin(entry.object.id);
        }
        if !entries.is_empty() {
            info!(target: "diver_agent::registry", count = entries.len(), "Registry cleared");
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.inner.lock().entries.contains_key(&handle)
    }

    /// Object recorded for a handle, without revalidation
    pub fn object_of(&self, handle: HandleId) -> Option<ObjectRef> {
        self.inner
            .lock()
            .entries
            .get(&handle)
            .map(|e| e.object.clone())
    }

    /// References `owner` holds on `handle`
    pub fn ref_count(&self, handle: HandleId, owner: ProcessId) -> usize {
        self.inner
            .lock()
            .entries
            .get(&handle)
            .and_then(|e| e.refs.get(&owner).copied())
            .unwrap_or(0)
    }
}
