//! Background sync engine.
//!
//! Drives the durable queue to completion against the remote API while the
//! connectivity monitor reports online. The engine alternates between Idle
//! and Draining: Draining processes FIFO batches sequentially, each remote
//! call bounded by a per-request timeout and the whole cycle by a per-cycle
//! deadline. Version conflicts are reconciled by applying the authoritative
//! server state and re-enqueueing the local edit when it still matters.
//! Auth failures halt draining entirely until re-authentication; everything
//! else degrades to a visible error state on the affected entity, never a
//! crash of the sync loop.

use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{RemoteApi, ServerAck, SyncOperation};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::db::DbState;
use crate::error::ApiError;
use crate::events::{EventBus, Subscription};
use crate::queue::{self, EnqueueOutcome};
use crate::store::{self, ApplyOutcome};
use crate::types::{Entity, EntityType, SyncAction, SyncQueueItem};

// ---------------------------------------------------------------------------
// Engine state & events
// ---------------------------------------------------------------------------

/// Engine activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Draining,
}

const STATE_IDLE: u8 = 0;
const STATE_DRAINING: u8 = 1;

/// Notifications emitted by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A drain cycle finished; `synced` items were confirmed or reconciled.
    CycleCompleted { synced: usize },
    /// The backend rejected our credentials. Draining is halted until
    /// `resume_after_auth` is called.
    AuthRequired { error: String },
    /// An item exhausted its retries; the owning entity is now `error`.
    EntityAbandoned {
        entity_type: EntityType,
        entity_id: String,
        error: String,
    },
}

/// Point-in-time view of sync progress, shaped for UI consumption.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub is_online: bool,
    pub is_draining: bool,
    pub pending_items: i64,
    pub failed_items: i64,
    pub last_sync_at: Option<String>,
    pub oldest_next_retry_at: Option<String>,
    pub auth_required: bool,
}

// ---------------------------------------------------------------------------
// Write-path helpers
// ---------------------------------------------------------------------------

/// Persist a local mutation and queue it for sync in one step: optimistic
/// store write (`syncStatus=pending`) followed by a coalescing enqueue.
/// Entities that have never been accepted by the server (no `version`) are
/// staged as creates, everything else as updates.
pub fn stage_upsert(db: &DbState, entity: &mut Entity) -> Result<EnqueueOutcome, String> {
    let entity_id = entity.client_id().to_string();

    // A pending delete is final for this id; resurrecting it would break
    // the one-effective-operation invariant.
    if let Some(active) = queue::find_active(db, entity.entity_type(), &entity_id)? {
        if active.action == SyncAction::Delete {
            return Err(format!(
                "operation rejected: delete already pending for {} {}",
                entity.entity_type().as_str(),
                entity_id
            ));
        }
    }

    let action = if entity.version().is_some() {
        SyncAction::Update
    } else {
        SyncAction::Create
    };

    store::upsert_local(db, entity)?;
    let outcome = queue::enqueue(db, entity.entity_type(), &entity_id, action, &entity.to_value())?;

    info!(
        entity_type = entity.entity_type().as_str(),
        entity_id = %entity_id,
        action = action.as_str(),
        "Entity staged for sync"
    );
    Ok(outcome)
}

/// Remove an entity locally and queue the remote delete. A delete of a
/// never-synced entity collapses against its unsent create and nothing is
/// sent at all.
pub fn stage_delete(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<EnqueueOutcome, String> {
    let entity = store::get_entity(db, entity_type, entity_id)?
        .ok_or_else(|| format!("entity not found: {} {entity_id}", entity_type.as_str()))?;
    let snapshot = entity.to_value();

    store::delete_local(db, entity_type, entity_id)?;
    let outcome = queue::enqueue(db, entity_type, entity_id, SyncAction::Delete, &snapshot)?;

    info!(
        entity_type = entity_type.as_str(),
        entity_id = %entity_id,
        collapsed = matches!(outcome, EnqueueOutcome::Cancelled),
        "Entity deleted locally"
    );
    Ok(outcome)
}

/// Manual retry for an entity stuck in `error`: re-stages it from current
/// local state, superseding the abandoned queue row and resetting the retry
/// budget.
pub fn retry_entity(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<EnqueueOutcome, String> {
    let mut entity = store::get_entity(db, entity_type, entity_id)?
        .ok_or_else(|| format!("entity not found: {} {entity_id}", entity_type.as_str()))?;
    stage_upsert(db, &mut entity)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Background sync engine. Construct one per application root and share it
/// by reference; all state lives on the instance, none of it global.
pub struct SyncEngine<R: RemoteApi> {
    db: Arc<DbState>,
    remote: R,
    monitor: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    state: AtomicU8,
    is_running: AtomicBool,
    auth_required: AtomicBool,
    /// Held for the duration of a drain; a trigger while draining is a no-op.
    drain_gate: tokio::sync::Mutex<()>,
    trigger: Notify,
    last_sync: Mutex<Option<String>>,
    events: EventBus<SyncEvent>,
    tracker: TaskTracker,
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn new(
        db: Arc<DbState>,
        remote: R,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            remote,
            monitor,
            config,
            state: AtomicU8::new(STATE_IDLE),
            is_running: AtomicBool::new(false),
            auth_required: AtomicBool::new(false),
            drain_gate: tokio::sync::Mutex::new(()),
            trigger: Notify::new(),
            last_sync: Mutex::new(None),
            events: EventBus::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        if self.state.load(Ordering::SeqCst) == STATE_DRAINING {
            EngineState::Draining
        } else {
            EngineState::Idle
        }
    }

    fn set_state(&self, state: EngineState) {
        let raw = match state {
            EngineState::Idle => STATE_IDLE,
            EngineState::Draining => STATE_DRAINING,
        };
        self.state.store(raw, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }

    /// Request an immediate drain attempt. Coalesced: while a drain is
    /// already running this is a no-op trigger.
    pub fn trigger_drain(&self) {
        self.trigger.notify_one();
    }

    /// Clear the auth halt after the caller re-authenticated, and kick off a
    /// drain right away.
    pub fn resume_after_auth(&self) {
        self.auth_required.store(false, Ordering::SeqCst);
        info!("Re-authentication complete; resuming queued sync");
        self.trigger.notify_one();
    }

    /// Explicit user logout: pending local writes survive (the queue is NOT
    /// cleared), but yet-unsent dispatched rows holding stale auth are reset
    /// to `pending` and draining halts until re-authentication.
    pub fn handle_logout(&self) -> Result<usize, String> {
        let requeued = queue::requeue_in_flight(&self.db)?;
        self.auth_required.store(true, Ordering::SeqCst);
        info!(requeued, "Logout: sync halted, queue preserved");
        Ok(requeued)
    }

    /// Spawn the background loop: drain on the configured interval, on every
    /// offline→online transition, and on explicit triggers. Idempotent;
    /// callers keep their own `Arc` clone for triggering and status reads.
    pub fn start(self: Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(&self);
        self.tracker.spawn(async move {
            info!(
                interval_secs = engine.config.sync_interval.as_secs(),
                "Sync loop started"
            );

            // Rows dispatched by a previous process that crashed before
            // acknowledge are still in_progress; put them back in rotation.
            match queue::requeue_in_flight(&engine.db) {
                Ok(recovered) if recovered > 0 => {
                    info!(recovered, "Recovered dispatched rows from previous session");
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to recover dispatched rows: {e}"),
            }

            let mut connectivity = engine.monitor.subscribe();
            let mut connectivity_alive = true;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(engine.config.sync_interval) => {}
                    _ = engine.trigger.notified() => {}
                    event = connectivity.recv(), if connectivity_alive => {
                        match event {
                            Some(ConnectivityEvent::Online) => {
                                info!("Network restored; resuming queued sync");
                            }
                            Some(ConnectivityEvent::Offline) => continue,
                            None => {
                                connectivity_alive = false;
                                continue;
                            }
                        }
                    }
                }

                if !engine.is_running.load(Ordering::SeqCst) {
                    info!("Sync loop stopped");
                    break;
                }
                if engine.auth_required.load(Ordering::SeqCst) {
                    debug!("Draining halted pending re-authentication");
                    continue;
                }
                if !engine.monitor.is_online() {
                    continue;
                }

                match engine.run_sync_cycle().await {
                    Ok(synced) if synced > 0 => {
                        info!("Sync cycle complete: {synced} items synced");
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Sync cycle failed: {e}"),
                }
            }
        });
    }

    /// Stop the background loop. Pending queue items stay durable.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.trigger.notify_one();
        self.tracker.close();
    }

    /// Stop and wait for the background loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.tracker.wait().await;
    }

    /// Trigger an immediate sync cycle and wait for it.
    pub async fn force_sync(&self) -> Result<usize, String> {
        let synced = self.run_sync_cycle().await?;
        info!("Force sync complete: {synced} items synced");
        Ok(synced)
    }

    /// Current queue/engine status for UI display.
    pub fn status_snapshot(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            is_online: self.monitor.is_online(),
            is_draining: self.state() == EngineState::Draining,
            pending_items: queue::pending_count(&self.db),
            failed_items: queue::failed_count(&self.db),
            last_sync_at: self.last_sync.lock().ok().and_then(|g| g.clone()),
            oldest_next_retry_at: queue::oldest_next_retry_at(&self.db),
            auth_required: self.auth_required.load(Ordering::SeqCst),
        }
    }

    // -----------------------------------------------------------------------
    // Drain cycle
    // -----------------------------------------------------------------------

    /// Run one drain cycle: process FIFO batches until the queue is empty,
    /// connectivity drops, or the cycle deadline expires. At most one cycle
    /// runs at a time; a concurrent call is a coalesced no-op.
    pub async fn run_sync_cycle(&self) -> Result<usize, String> {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            debug!("Drain already in progress; trigger coalesced");
            return Ok(0);
        };

        if self.auth_required.load(Ordering::SeqCst) {
            return Err("AUTH_ERROR: re-authentication required before syncing".to_string());
        }

        self.set_state(EngineState::Draining);
        let synced = AtomicUsize::new(0);

        let result = tokio::time::timeout(self.config.cycle_timeout, self.drain_queue(&synced)).await;
        let drained = synced.load(Ordering::SeqCst);

        let outcome = match result {
            Ok(Ok(())) => {
                if let Ok(mut guard) = self.last_sync.lock() {
                    *guard = Some(Utc::now().to_rfc3339());
                }
                self.events.emit(&SyncEvent::CycleCompleted { synced: drained });
                Ok(drained)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Sync cycle deadline exceeded; failing in-flight items");
                self.fail_in_flight("TIMEOUT_ERROR: sync cycle deadline exceeded")?;
                Ok(drained)
            }
        };

        self.set_state(EngineState::Idle);
        outcome
    }

    async fn drain_queue(&self, synced: &AtomicUsize) -> Result<(), String> {
        loop {
            // Going offline mid-drain lets dispatched requests finish but
            // starts no new batch.
            if !self.monitor.is_online() {
                debug!("Offline mid-drain; no new batch scheduled");
                return Ok(());
            }

            let batch = queue::dequeue_batch(&self.db, self.config.batch_size)?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!(items = batch.len(), "Draining sync batch");

            for item in batch {
                self.process_item(item, synced).await?;
            }
        }
    }

    /// Process one queue item. Returns `Err` only for the auth halt; every
    /// other failure is absorbed into the item's retry bookkeeping.
    async fn process_item(&self, item: SyncQueueItem, synced: &AtomicUsize) -> Result<(), String> {
        let op = SyncOperation {
            entity_type: item.entity_type,
            entity_id: item.entity_id.clone(),
            action: item.action,
            payload: item.payload.clone(),
            idempotency_key: item.idempotency_key.clone(),
            expected_version: item.expected_version(),
        };

        let result = match tokio::time::timeout(self.config.request_timeout, self.remote.push(&op)).await
        {
            Ok(r) => r,
            Err(_) => Err(ApiError::Timeout("request deadline exceeded".to_string())),
        };

        match result {
            Ok(ack) => {
                self.confirm_item(&item, &ack)?;
                synced.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(ApiError::Conflict { current }) => {
                self.resolve_conflict(&item, current).await?;
                synced.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(ApiError::Auth(message)) => {
                warn!(error = %message, "Auth failure during drain; halting");
                let requeued = queue::requeue_in_flight(&self.db)?;
                self.auth_required.store(true, Ordering::SeqCst);
                self.events.emit(&SyncEvent::AuthRequired {
                    error: message.clone(),
                });
                Err(format!("AUTH_ERROR: {message} ({requeued} items re-queued)"))
            }
            Err(err) => {
                let message = err.to_string();
                debug!(
                    queue_id = item.id,
                    entity_id = %item.entity_id,
                    error = %message,
                    "Sync attempt failed"
                );
                let outcome = queue::fail(&self.db, &item, &message, &self.config)?;
                if outcome.abandoned {
                    store::mark_error(&self.db, item.entity_type, &item.entity_id, &message)?;
                    self.events.emit(&SyncEvent::EntityAbandoned {
                        entity_type: item.entity_type,
                        entity_id: item.entity_id.clone(),
                        error: message,
                    });
                }
                Ok(())
            }
        }
    }

    /// Confirmed remote acceptance: fold the server-assigned version back
    /// into the local record, then retire the queue row. If the row was
    /// coalesced while in flight, acknowledge keeps it pending and the newer
    /// payload syncs on the next batch.
    fn confirm_item(&self, item: &SyncQueueItem, ack: &ServerAck) -> Result<(), String> {
        if item.action != SyncAction::Delete {
            let mut confirmed = item.payload.clone();
            if let Value::Object(obj) = &mut confirmed {
                obj.insert("version".to_string(), serde_json::json!(ack.version));
                obj.insert(
                    "lastModifiedAt".to_string(),
                    serde_json::json!(ack.last_modified_at.to_rfc3339()),
                );
            }
            store::apply_server_state(&self.db, item.entity_type, &confirmed, Some(&item.payload))?;
        }

        queue::acknowledge(&self.db, item)?;
        debug!(
            queue_id = item.id,
            entity_id = %item.entity_id,
            version = ack.version,
            "Sync item confirmed"
        );
        Ok(())
    }

    /// Version conflict: fetch the authoritative state (the 409 body usually
    /// carries it), reconcile through the store's merge, and re-enqueue a
    /// fresh operation when the local edit still matters. Conflicts never
    /// count against the retry budget.
    async fn resolve_conflict(&self, item: &SyncQueueItem, current: Option<Value>) -> Result<(), String> {
        let server_state = match current {
            Some(v) => Some(v),
            None => {
                match tokio::time::timeout(
                    self.config.request_timeout,
                    self.remote.fetch_entity(item.entity_type, &item.entity_id),
                )
                .await
                {
                    Ok(Ok(state)) => state,
                    Ok(Err(e)) => {
                        // The conflict itself is free, but a failed state
                        // fetch is an ordinary failure for this item.
                        let message = e.to_string();
                        let outcome = queue::fail(&self.db, item, &message, &self.config)?;
                        if outcome.abandoned {
                            store::mark_error(&self.db, item.entity_type, &item.entity_id, &message)?;
                            self.events.emit(&SyncEvent::EntityAbandoned {
                                entity_type: item.entity_type,
                                entity_id: item.entity_id.clone(),
                                error: message,
                            });
                        }
                        return Ok(());
                    }
                    Err(_) => {
                        let message = "TIMEOUT_ERROR: conflict state fetch deadline exceeded";
                        queue::fail(&self.db, item, message, &self.config)?;
                        return Ok(());
                    }
                }
            }
        };

        let Some(server_state) = server_state else {
            // Conflict but no server copy: the entity was deleted remotely.
            // A local delete is moot; anything else re-stages as a create.
            queue::acknowledge(&self.db, item)?;
            if item.action != SyncAction::Delete {
                if let Some(entity) = store::get_entity(&self.db, item.entity_type, &item.entity_id)? {
                    queue::enqueue(
                        &self.db,
                        item.entity_type,
                        &item.entity_id,
                        SyncAction::Create,
                        &entity.to_value(),
                    )?;
                    info!(
                        entity_id = %item.entity_id,
                        "Entity deleted remotely; re-staged local state as create"
                    );
                }
            }
            return Ok(());
        };

        let outcome =
            store::apply_server_state(&self.db, item.entity_type, &server_state, Some(&item.payload))?;
        queue::acknowledge(&self.db, item)?;

        match outcome {
            ApplyOutcome::Synced => {
                info!(
                    entity_id = %item.entity_id,
                    "Conflict resolved; local change was moot after reconciliation"
                );
            }
            ApplyOutcome::PendingLocalEdits => {
                // Rebuild the operation from the reconciled state, which now
                // carries the server's version for the next attempt.
                if let Some(entity) = store::get_entity(&self.db, item.entity_type, &item.entity_id)? {
                    let action = if entity.version().is_some() {
                        SyncAction::Update
                    } else {
                        SyncAction::Create
                    };
                    queue::enqueue(
                        &self.db,
                        item.entity_type,
                        &item.entity_id,
                        action,
                        &entity.to_value(),
                    )?;
                    info!(
                        entity_id = %item.entity_id,
                        "Conflict resolved; re-enqueued reconciled local edit"
                    );
                }
            }
        }
        Ok(())
    }

    /// Treat dispatched-but-unacknowledged items as failed (consuming a
    /// retry each). Used when the cycle deadline expires mid-flight.
    fn fail_in_flight(&self, error: &str) -> Result<(), String> {
        let in_flight = queue::load_in_flight(&self.db)?;
        for item in in_flight {
            let outcome = queue::fail(&self.db, &item, error, &self.config)?;
            if outcome.abandoned {
                store::mark_error(&self.db, item.entity_type, &item.entity_id, error)?;
                self.events.emit(&SyncEvent::EntityAbandoned {
                    entity_type: item.entity_type,
                    entity_id: item.entity_id.clone(),
                    error: error.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
