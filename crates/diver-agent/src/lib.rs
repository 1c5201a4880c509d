//! Diver Agent
//!
//! Server loaded into a running managed process. It exposes the target's
//! live objects to controllers over loopback TCP: type inspection, member
//! access and invocation by handle, event subscriptions and method hooks
//! whose firings are pushed back to the controller.
//!
//! The execution engine is reached through [`ManagedRuntime`]; this crate
//! ships [`SimRuntime`], an in-memory implementation.
//!
//! # Lifecycle
//! The bootstrap loader calls [`entry_point`] with a configuration string.
//! The diver serves until a controller sends `die`.

pub mod config;
pub mod dispatch;
pub mod diver;
pub mod events;
pub mod heap;
pub mod hooks;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod session;

pub use config::DiverConfig;
pub use diver::Diver;
pub use runtime::{ManagedRuntime, SimRuntime};
pub use server::DiverServer;
pub use session::{ConnectionId, DuplicateSessionPolicy};

use diver_common::{error, info, init_agent_logging, init_logging, Result};
use std::panic;
use std::sync::Arc;

/// Exit codes returned by [`entry_point`]
pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_ARGUMENT: i32 = 1;
pub const EXIT_FAILED: i32 = 2;

/// Install custom panic handler for crash reporting
fn install_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "diver_agent::panic",
            message = %payload,
            location = %location,
            "PANIC in diver"
        );
    }));
}

/// Called by the bootstrap loader once the diver is loaded.
///
/// `argument` is a bare port or `key=value;...` pairs (see
/// [`DiverConfig::from_argument`]). Blocks until the diver dies.
pub fn entry_point(runtime: Arc<dyn ManagedRuntime>, argument: &str) -> i32 {
    let config = match DiverConfig::from_argument(argument) {
        Ok(config) => config,
        Err(e) => {
            init_agent_logging("info");
            error!(target: "diver_agent", argument, error = %e, "Invalid diver argument");
            return EXIT_BAD_ARGUMENT;
        }
    };

    // in-target default is a per-pid file; an explicit log file wins
    if config.logging.file_enabled {
        init_logging(&config.logging);
    } else {
        init_agent_logging(&config.logging.level);
    }
    install_panic_handler();
    info!(target: "diver_agent", port = config.port, version = diver_common::VERSION, "Diver starting");

    let tokio_runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("diver-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: "diver_agent", error = %e, "Failed to create tokio runtime");
            return EXIT_FAILED;
        }
    };

    match tokio_runtime.block_on(run(runtime, config)) {
        Ok(()) => {
            info!(target: "diver_agent", "Diver exited");
            EXIT_OK
        }
        Err(e) => {
            error!(target: "diver_agent", error = %e, "Diver failed");
            EXIT_FAILED
        }
    }
}

/// Bind, serve until `die`, then tear everything down
pub async fn run(runtime: Arc<dyn ManagedRuntime>, config: DiverConfig) -> Result<()> {
    let diver = Arc::new(Diver::new(runtime, config)?);
    let server = DiverServer::bind(diver).await?;
    server.run().await
}
