//! Offline-first order sync core.
//!
//! Local mutations are written optimistically to the entity store and queued
//! durably for sync; a background engine drains the queue against the remote
//! API whenever the connectivity monitor reports online, with coalescing,
//! retry/backoff, and version-conflict reconciliation. The engine is an
//! explicitly constructed instance owned by the application root and shared
//! by reference; there are no global singletons.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod events;
pub mod queue;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

pub use api::{RemoteApi, RemoteClient, ServerAck, SyncOperation};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use error::{ApiError, SyncErrorKind};
pub use queue::{EnqueueOutcome, FailOutcome};
pub use store::ApplyOutcome;
pub use sync::{
    retry_entity, stage_delete, stage_upsert, EngineState, SyncEngine, SyncEvent,
    SyncStatusSnapshot,
};
pub use types::{
    Entity, EntityType, Order, OrderItem, OrderStatus, Product, SyncAction, SyncQueueItem,
    SyncStatus,
};

/// Initialize structured logging: console always, plus a daily-rolling file
/// layer when `log_dir` is given. Call once at application startup.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ordersync_core=debug"));

    let console_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "ordersync");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            // Keep the guard alive for the lifetime of the app — dropping it
            // flushes logs. Leaked intentionally since logging runs until
            // process exit.
            std::mem::forget(guard);
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
        }
    }

    info!(
        "ordersync-core v{} logging initialized",
        env!("CARGO_PKG_VERSION")
    );
}
