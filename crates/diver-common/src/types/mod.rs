//! Types shared by the diver and its controllers
//!
//! - `handle` - addresses, handles, tokens, callback endpoints
//! - `value` - primitives and wire values
//! - `hooks` - hook positions and token lifecycle
//! - `dump` - type descriptors
//! - `query` - remote collection queries

pub mod dump;
pub mod handle;
pub mod hooks;
pub mod query;
pub mod value;

pub use dump::*;
pub use handle::*;
pub use hooks::*;
pub use query::*;
pub use value::*;
