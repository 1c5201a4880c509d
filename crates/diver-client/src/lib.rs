//! Diver Client
//!
//! Controller-side access to a diver running inside a target process.
//!
//! ```no_run
//! # async fn demo() -> diver_client::Result<()> {
//! use diver_client::{ClientConfig, DiverClient};
//!
//! let client = DiverClient::open(ClientConfig::with_port(9977)).await?;
//! let found = client.search_heap("Game.*Enemy").await?;
//! if let Some(address) = found.first() {
//!     let enemy = client.proxy(client.pin_object(address).await?);
//!     let name = enemy.member("Name").read().await?;
//!     println!("{:?}", name.as_str());
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod proxy;

pub use callbacks::{CallbackHandler, CallbackListener};
pub use client::{ConnectionHealth, ConnectionState, DiverClient};
pub use config::{ClientConfig, HeartbeatConfig, RetryConfig};
pub use error::{ClientError, Result};
pub use proxy::{QueryResult, RemoteObject, RemoteQuery, RemoteValue};
