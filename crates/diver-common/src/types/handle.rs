//! Object identity types: addresses, handles and tokens

use serde::{Deserialize, Serialize};

/// Controller process id, the key of a session
pub type ProcessId = u32;

/// A location of a live object at a point in time, tagged with its type.
///
/// Addresses move across collections; always revalidate before use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub address: u64,
    pub type_name: String,
}

impl ObjectAddress {
    pub fn new(address: u64, type_name: impl Into<String>) -> Self {
        Self {
            address,
            type_name: type_name.into(),
        }
    }
}

impl std::fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#x}", self.type_name, self.address)
    }
}

/// Registry key of a pinned object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle_{}", self.0)
    }
}

/// Controller-visible identity of a remote object.
///
/// `handle` is stable while the registry entry lives; `address` is the last
/// address the diver observed and is informational.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub handle: HandleId,
    pub address: u64,
    pub type_name: String,
}

impl RemoteHandle {
    pub fn new(handle: HandleId, address: u64, type_name: impl Into<String>) -> Self {
        Self {
            handle,
            address,
            type_name: type_name.into(),
        }
    }

    pub fn object_address(&self) -> ObjectAddress {
        ObjectAddress::new(self.address, self.type_name.clone())
    }
}

/// Identifier of a hook or event subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token(pub u64);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token_{}", self.0)
    }
}

/// Loopback address a controller listens on for pushed callbacks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackEndpoint(pub String);

impl CallbackEndpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn socket_addr(&self) -> crate::Result<std::net::SocketAddr> {
        self.0
            .parse()
            .map_err(|e| crate::Error::protocol(format!("Invalid callback endpoint {}: {}", self.0, e)))
    }
}

impl std::fmt::Display for CallbackEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
