//! Heap inspection and address validation

use crate::runtime::{ManagedRuntime, ObjectId, ObjectRef};
use diver_common::{Error, ObjectAddress, Result, TypeDump};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Validates addresses against the live heap and searches it by type.
///
/// An address is only trusted after it resolves to an allocated,
/// root-reachable object assignable to the expected type.
pub struct HeapInspector {
    runtime: Arc<dyn ManagedRuntime>,
}

impl HeapInspector {
    pub fn new(runtime: Arc<dyn ManagedRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ManagedRuntime> {
        &self.runtime
    }

    /// Describe a loaded type
    pub fn resolve_type(&self, assembly: Option<&str>, type_name: &str) -> Result<TypeDump> {
        self.runtime.dump_type(assembly, type_name)
    }

    /// The live object at `address`, if it is reachable and assignable to `expected_type`
    pub fn validate(&self, address: u64, expected_type: &str) -> Result<ObjectRef> {
        let Some(found) = self.runtime.object_at(address) else {
            trace!(
                target: "diver_agent::heap",
                address = format!("0x{:x}", address),
                "Nothing allocated at address"
            );
            return Err(Error::stale(address, expected_type));
        };
        if !found.reachable {
            trace!(
                target: "diver_agent::heap",
                object = %found.object.object_address(),
                "Object is unreachable"
            );
            return Err(Error::stale(address, expected_type));
        }
        if !self
            .runtime
            .is_assignable(&found.object.type_name, expected_type)
        {
            trace!(
                target: "diver_agent::heap",
                object = %found.object.object_address(),
                expected = expected_type,
                "Type mismatch at address"
            );
            return Err(Error::stale(address, expected_type));
        }
        Ok(found.object)
    }

    /// Like [`validate`](Self::validate), and the object must also be `id`
    pub fn validate_identity(
        &self,
        address: u64,
        expected_type: &str,
        id: ObjectId,
    ) -> Result<ObjectRef> {
        let object = self.validate(address, expected_type)?;
        if object.id != id {
            debug!(
                target: "diver_agent::heap",
                address = format!("0x{:x}", address),
                "Address now holds a different object"
            );
            return Err(Error::stale(address, expected_type));
        }
        Ok(object)
    }

    /// Find a relocated object by identity
    pub fn reacquire(
        &self,
        id: ObjectId,
        expected_type: &str,
        last_address: u64,
    ) -> Result<ObjectRef> {
        match self.runtime.locate(id) {
            Some(found)
                if found.reachable
                    && self
                        .runtime
                        .is_assignable(&found.object.type_name, expected_type) =>
            {
                debug!(
                    target: "diver_agent::heap",
                    from = format!("0x{:x}", last_address),
                    to = format!("0x{:x}", found.object.address),
                    "Re-acquired relocated object"
                );
                Ok(found.object)
            }
            _ => Err(Error::stale(last_address, expected_type)),
        }
    }

    /// Live instances whose type name matches `type_filter` (`*` is a wildcard)
    pub fn search(&self, type_filter: &str) -> Result<Vec<ObjectAddress>> {
        let pattern = compile_type_filter(type_filter)?;
        let found: Vec<ObjectAddress> = self
            .runtime
            .enumerate_instances(&|name| pattern.is_match(name))
            .into_iter()
            .filter(|o| o.reachable)
            .map(|o| o.object.object_address())
            .collect();
        debug!(
            target: "diver_agent::heap",
            filter = type_filter,
            count = found.len(),
            "Heap search"
        );
        Ok(found)
    }
}

/// Compile a type filter into an anchored regex; `*` matches any run of characters
pub fn compile_type_filter(filter: &str) -> Result<Regex> {
    if filter.is_empty() {
        return Err(Error::protocol("Type filter must not be empty"));
    }
    let body = filter
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| Error::protocol(format!("Invalid type filter {}: {}", filter, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::{SimRuntime, TypeBuilder};
    use diver_common::ErrorKind;

    fn setup() -> (Arc<SimRuntime>, HeapInspector) {
        let rt = Arc::new(SimRuntime::new());
        rt.define_type(TypeBuilder::new("Demo", "Demo.Enemy").field("Hp", "int"));
        rt.define_type(TypeBuilder::new("Demo", "Demo.Boss").base("Demo.Enemy"));
        rt.define_type(TypeBuilder::new("Demo", "Demo.Item"));
        let inspector = HeapInspector::new(rt.clone());
        (rt, inspector)
    }

    #[test]
    fn test_filter_compilation() {
        let re = compile_type_filter("Demo.*").unwrap();
        assert!(re.is_match("Demo.Enemy"));
        assert!(!re.is_match("DemoXEnemy"));
        assert!(!re.is_match("Other.Demo.Enemy"));

        let exact = compile_type_filter("Demo.Enemy").unwrap();
        assert!(!exact.is_match("Demo.EnemyList"));
        assert!(compile_type_filter("").is_err());
    }

    #[test]
    fn test_search_only_returns_reachable() {
        let (rt, heap) = setup();
        let kept = rt.new_object("Demo.Enemy").unwrap();
        let _garbage = rt.new_object("Demo.Enemy").unwrap();
        let boss = rt.new_object("Demo.Boss").unwrap();
        rt.add_root(kept.id);
        rt.add_root(boss.id);

        let found = heap.search("Demo.Enemy").unwrap();
        assert_eq!(found, vec![kept.object_address()]);
        assert_eq!(heap.search("Demo.*").unwrap().len(), 2);
    }

    #[test]
    fn test_validate_checks_assignability_not_just_type() {
        let (rt, heap) = setup();
        let boss = rt.new_object("Demo.Boss").unwrap();
        rt.add_root(boss.id);

        assert_eq!(heap.validate(boss.address, "Demo.Enemy").unwrap().id, boss.id);
        let err = heap.validate(boss.address, "Demo.Item").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StaleReference);
        assert!(heap.validate(0xdead_0000, "Demo.Enemy").is_err());
    }

    #[test]
    fn test_validate_rejects_unreachable() {
        let (rt, heap) = setup();
        let loose = rt.new_object("Demo.Enemy").unwrap();
        assert!(heap.validate(loose.address, "Demo.Enemy").is_err());
    }

    #[test]
    fn test_identity_and_reacquire() {
        let (rt, heap) = setup();
        let first = rt.new_object("Demo.Enemy").unwrap();
        let second = rt.new_object("Demo.Enemy").unwrap();
        rt.add_root(second.id);
        rt.collect();
        rt.compact();

        // second slid into first's slot
        assert!(heap
            .validate_identity(first.address, "Demo.Enemy", first.id)
            .is_err());
        let moved = heap
            .reacquire(second.id, "Demo.Enemy", second.address)
            .unwrap();
        assert_eq!(moved.address, first.address);
        assert!(heap.reacquire(first.id, "Demo.Enemy", first.address).is_err());
    }
}
