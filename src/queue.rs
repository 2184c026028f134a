//! Durable sync queue.
//!
//! An ordered record of pending remote operations, one effective operation
//! per `(entity_type, entity_id)`: a later enqueue for the same entity
//! coalesces with the earlier unsent one instead of growing the queue.
//! Items are dequeued in insertion order but stay in the table (marked
//! `in_progress`) until explicitly acknowledged, so a crash mid-send never
//! loses work. Failures reschedule with exponential backoff until the retry
//! budget is exhausted, at which point the row is abandoned and the owning
//! entity must be marked `error` by the caller.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS};
use crate::db::DbState;
use crate::error::{extract_retry_after_seconds, is_backpressure_error};
use crate::types::{EntityType, QueueStatus, SyncAction, SyncQueueItem};

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was appended.
    Inserted(i64),
    /// An existing active row absorbed the operation.
    Coalesced(i64),
    /// A delete collapsed against an unsent create; nothing remains queued.
    Cancelled,
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailOutcome {
    /// Retry budget exhausted; the row left the active queue and the owning
    /// entity must be marked `error`.
    pub abandoned: bool,
    /// Server backpressure; the row was deferred without consuming a retry.
    pub backpressure_deferred: bool,
}

// ---------------------------------------------------------------------------
// Backoff schedule
// ---------------------------------------------------------------------------

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter)).to_rfc3339()
}

// ---------------------------------------------------------------------------
// Enqueue (with coalescing)
// ---------------------------------------------------------------------------

/// Append a pending operation, or coalesce it into the entity's existing
/// active row. The read-modify-write runs in one transaction under the
/// connection lock, so concurrent enqueues for the same entity serialize.
///
/// Coalescing rules:
/// - create + update  → stays `create`, payload replaced
/// - create + delete  → both collapse; the queue row is removed
/// - update + update  → payload replaced
/// - update + delete  → becomes `delete`
/// - delete + update/create → rejected; a pending delete is final
/// - same action twice → payload replaced
///
/// A coalesce refreshes the enqueue timestamp and resets `retries` to 0;
/// a fresh logical operation disregards prior failure count. An abandoned
/// (`failed`) row for the same entity is superseded by the new operation.
pub fn enqueue(
    db: &DbState,
    entity_type: EntityType,
    entity_id: &str,
    action: SyncAction,
    payload: &Value,
) -> Result<EnqueueOutcome, String> {
    let mut guard = db.conn.lock().map_err(|e| e.to_string())?;
    let tx = guard
        .transaction()
        .map_err(|e| format!("begin enqueue tx: {e}"))?;

    let existing: Option<(i64, String)> = tx
        .query_row(
            "SELECT id, action FROM sync_queue
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status IN ('pending', 'in_progress')
             LIMIT 1",
            params![entity_type.as_str(), entity_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("query active queue row: {e}"))?;

    let now = Utc::now().to_rfc3339();
    let payload_text = payload.to_string();

    let outcome = match existing {
        None => {
            // A fresh operation supersedes any abandoned row for this entity.
            tx.execute(
                "DELETE FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'failed'",
                params![entity_type.as_str(), entity_id],
            )
            .map_err(|e| format!("supersede abandoned row: {e}"))?;

            let idempotency_key = format!(
                "{}:{}:{}",
                entity_type.as_str(),
                entity_id,
                Utc::now().timestamp_millis()
            );
            tx.execute(
                "INSERT INTO sync_queue (
                    entity_type, entity_id, action, payload, idempotency_key,
                    status, retry_count, retry_delay_ms, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7, ?7)",
                params![
                    entity_type.as_str(),
                    entity_id,
                    action.as_str(),
                    payload_text,
                    idempotency_key,
                    DEFAULT_RETRY_DELAY_MS,
                    now,
                ],
            )
            .map_err(|e| format!("insert queue row: {e}"))?;
            EnqueueOutcome::Inserted(tx.last_insert_rowid())
        }
        Some((id, existing_action_raw)) => {
            let existing_action = SyncAction::parse(&existing_action_raw)?;
            match (existing_action, action) {
                (SyncAction::Delete, SyncAction::Update)
                | (SyncAction::Delete, SyncAction::Create) => {
                    return Err(format!(
                        "operation rejected: delete already pending for {} {}",
                        entity_type.as_str(),
                        entity_id
                    ));
                }
                (SyncAction::Create, SyncAction::Delete) => {
                    // Never reached the server; nothing to delete remotely.
                    tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
                        .map_err(|e| format!("collapse create+delete: {e}"))?;
                    tx.commit().map_err(|e| format!("commit enqueue: {e}"))?;
                    debug!(
                        entity_id,
                        "Unsent create collapsed against delete; queue row removed"
                    );
                    return Ok(EnqueueOutcome::Cancelled);
                }
                (existing_action, new_action) => {
                    // create absorbs updates and stays a create; update+delete
                    // becomes the delete; otherwise the action is unchanged.
                    let effective = match (existing_action, new_action) {
                        (SyncAction::Create, _) => SyncAction::Create,
                        (SyncAction::Update, SyncAction::Delete) => SyncAction::Delete,
                        (kept, _) => kept,
                    };
                    tx.execute(
                        "UPDATE sync_queue
                         SET action = ?1,
                             payload = ?2,
                             retry_count = 0,
                             last_error = NULL,
                             next_retry_at = NULL,
                             retry_delay_ms = ?3,
                             created_at = ?4,
                             updated_at = ?4,
                             rev = rev + 1
                         WHERE id = ?5",
                        params![
                            effective.as_str(),
                            payload_text,
                            DEFAULT_RETRY_DELAY_MS,
                            now,
                            id
                        ],
                    )
                    .map_err(|e| format!("coalesce queue row: {e}"))?;
                    EnqueueOutcome::Coalesced(id)
                }
            }
        }
    };

    tx.commit().map_err(|e| format!("commit enqueue: {e}"))?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Dequeue / acknowledge / fail
// ---------------------------------------------------------------------------

const ITEM_COLUMNS: &str = "id, entity_type, entity_id, action, payload, idempotency_key, \
     status, retry_count, last_error, created_at, next_retry_at, \
     COALESCE(retry_delay_ms, 5000), rev";

fn map_item(row: (i64, String, String, String, String, String, String, i64, Option<String>, String, Option<String>, i64, i64)) -> Option<SyncQueueItem> {
    let (
        id,
        entity_type,
        entity_id,
        action,
        payload,
        idempotency_key,
        status,
        retries,
        last_error,
        enqueued_at,
        next_retry_at,
        retry_delay_ms,
        rev,
    ) = row;

    let parse = || -> Result<SyncQueueItem, String> {
        Ok(SyncQueueItem {
            id,
            entity_type: EntityType::parse(&entity_type)?,
            entity_id,
            action: SyncAction::parse(&action)?,
            payload: serde_json::from_str(&payload).map_err(|e| format!("payload: {e}"))?,
            idempotency_key,
            status: QueueStatus::parse(&status)?,
            retries,
            last_error,
            enqueued_at,
            next_retry_at,
            retry_delay_ms,
            rev,
        })
    };

    match parse() {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(queue_id = id, error = %e, "Skipping malformed queue row");
            None
        }
    }
}

fn query_items(conn: &Connection, where_clause: &str, limit: Option<usize>) -> Result<Vec<SyncQueueItem>, String> {
    let limit_clause = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
    let query = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE {where_clause} ORDER BY id ASC{limit_clause}"
    );
    let mut stmt = conn.prepare(&query).map_err(|e| e.to_string())?;

    let items = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .filter_map(map_item)
        .collect();

    Ok(items)
}

/// Read up to `n` eligible items in insertion order and mark them
/// `in_progress`. Rows stay in the table until acknowledged.
pub fn dequeue_batch(db: &DbState, n: usize) -> Result<Vec<SyncQueueItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let items = query_items(
        &conn,
        "status = 'pending'
           AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))",
        Some(n),
    )?;

    for item in &items {
        let _ = conn.execute(
            "UPDATE sync_queue SET status = 'in_progress', updated_at = datetime('now') WHERE id = ?1",
            params![item.id],
        );
    }

    Ok(items)
}

/// Remove an item after confirmed remote success. Returns `false` when the
/// row was coalesced while in flight; the newer payload is put back to
/// `pending` instead of being dropped.
pub fn acknowledge(db: &DbState, item: &SyncQueueItem) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let deleted = conn
        .execute(
            "DELETE FROM sync_queue WHERE id = ?1 AND rev = ?2",
            params![item.id, item.rev],
        )
        .map_err(|e| format!("acknowledge queue row: {e}"))?;

    if deleted > 0 {
        return Ok(true);
    }

    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE id = ?1 AND status = 'in_progress'",
        params![item.id],
    )
    .map_err(|e| format!("requeue coalesced row: {e}"))?;
    debug!(
        queue_id = item.id,
        "Row coalesced while in flight; kept pending with newer payload"
    );
    Ok(false)
}

/// Record a failed attempt. Backpressure defers without consuming a retry;
/// otherwise the retry count increments and the row is rescheduled with
/// doubled backoff, or abandoned once the count exceeds the maximum.
pub fn fail(
    db: &DbState,
    item: &SyncQueueItem,
    error: &str,
    config: &SyncConfig,
) -> Result<FailOutcome, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    if is_backpressure_error(error) {
        let retry_after_secs = extract_retry_after_seconds(error).unwrap_or(5).max(1);
        let delay_ms = (retry_after_secs * 1000).clamp(1_000, config.max_retry_delay_ms);
        let next_retry_at = schedule_next_retry(delay_ms, item.id);
        conn.execute(
            "UPDATE sync_queue
             SET status = 'pending',
                 next_retry_at = ?1,
                 retry_delay_ms = ?2,
                 last_error = ?3,
                 updated_at = datetime('now')
             WHERE id = ?4 AND rev = ?5",
            params![next_retry_at, delay_ms, error, item.id, item.rev],
        )
        .map_err(|e| format!("defer queue row: {e}"))?;
        return Ok(FailOutcome {
            abandoned: false,
            backpressure_deferred: true,
        });
    }

    let new_count = item.retries + 1;
    let exhausted = new_count > config.max_retries;
    let new_status = if exhausted { "failed" } else { "pending" };
    let next_delay = (item.retry_delay_ms.max(config.retry_delay_ms) * 2).min(config.max_retry_delay_ms);
    let next_retry_at = if exhausted {
        None
    } else {
        Some(schedule_next_retry(next_delay, item.id))
    };

    let updated = conn
        .execute(
            "UPDATE sync_queue
             SET status = ?1,
                 retry_count = ?2,
                 next_retry_at = ?3,
                 retry_delay_ms = ?4,
                 last_error = ?5,
                 updated_at = datetime('now')
             WHERE id = ?6 AND rev = ?7",
            params![
                new_status, new_count, next_retry_at, next_delay, error, item.id, item.rev
            ],
        )
        .map_err(|e| format!("fail queue row: {e}"))?;

    if updated == 0 {
        // Coalesced while in flight: the row already reset its retry budget.
        conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'in_progress'",
            params![item.id],
        )
        .map_err(|e| format!("requeue coalesced row: {e}"))?;
        return Ok(FailOutcome {
            abandoned: false,
            backpressure_deferred: false,
        });
    }

    if exhausted {
        info!(
            queue_id = item.id,
            entity_id = %item.entity_id,
            retries = new_count,
            "Queue item abandoned after exhausting retries"
        );
    }

    Ok(FailOutcome {
        abandoned: exhausted,
        backpressure_deferred: false,
    })
}

// ---------------------------------------------------------------------------
// In-flight management
// ---------------------------------------------------------------------------

/// Items currently marked `in_progress` (dispatched but unacknowledged).
pub fn load_in_flight(db: &DbState) -> Result<Vec<SyncQueueItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_items(&conn, "status = 'in_progress'", None)
}

/// Reset dispatched-but-unacknowledged rows to `pending` without consuming a
/// retry. Used on auth halt and logout, where the failure is not the item's.
pub fn requeue_in_flight(db: &DbState) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_progress'",
        [],
    )
    .map_err(|e| format!("requeue in-flight rows: {e}"))
}

/// The entity's active (pending/in-progress) queue row, if any.
pub fn find_active(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<Option<SyncQueueItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let items = query_items(
        &conn,
        "status IN ('pending', 'in_progress')",
        None,
    )?;
    Ok(items
        .into_iter()
        .find(|i| i.entity_type == entity_type && i.entity_id == entity_id))
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

fn count_where(conn: &Connection, where_clause: &str) -> i64 {
    let query = format!("SELECT COUNT(*) FROM sync_queue WHERE {where_clause}");
    conn.query_row(&query, [], |row| row.get(0)).unwrap_or(0)
}

/// Items still waiting to sync (pending or dispatched).
pub fn pending_count(db: &DbState) -> i64 {
    match db.conn.lock() {
        Ok(conn) => count_where(&conn, "status IN ('pending', 'in_progress')"),
        Err(_) => 0,
    }
}

/// Abandoned items awaiting manual retry.
pub fn failed_count(db: &DbState) -> i64 {
    match db.conn.lock() {
        Ok(conn) => count_where(&conn, "status = 'failed'"),
        Err(_) => 0,
    }
}

/// Earliest scheduled retry among deferred rows.
pub fn oldest_next_retry_at(db: &DbState) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    conn.query_row(
        "SELECT MIN(next_retry_at) FROM sync_queue
         WHERE status = 'pending' AND next_retry_at IS NOT NULL",
        [],
        |row| row.get(0),
    )
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    fn payload(tag: &str) -> Value {
        serde_json::json!({ "customerName": tag, "version": 1 })
    }

    fn force_eligible(db: &DbState, queue_id: i64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_queue SET next_retry_at = NULL WHERE id = ?1",
            params![queue_id],
        )
        .unwrap();
    }

    #[test]
    fn test_create_then_update_keeps_single_create_with_latest_payload() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("first")).unwrap();
        let outcome =
            enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("second")).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Coalesced(_)));

        let items = dequeue_batch(&db, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, SyncAction::Create);
        assert_eq!(items[0].payload.get("customerName").unwrap(), "second");
    }

    #[test]
    fn test_delete_after_create_collapses_to_nothing() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        let outcome =
            enqueue(&db, EntityType::Order, "o1", SyncAction::Delete, &Value::Null).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Cancelled);

        assert!(dequeue_batch(&db, 10).unwrap().is_empty());
        assert_eq!(pending_count(&db), 0);
    }

    #[test]
    fn test_update_after_delete_is_rejected() {
        let db = test_db();

        // A synced entity being deleted leaves a delete row behind
        enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("a")).unwrap();
        enqueue(&db, EntityType::Order, "o1", SyncAction::Delete, &payload("a")).unwrap();

        let err =
            enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("b")).unwrap_err();
        assert!(err.contains("delete already pending"));

        let items = dequeue_batch(&db, 10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, SyncAction::Delete);
    }

    #[test]
    fn test_coalesce_resets_retry_budget() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("a")).unwrap();
        let item = dequeue_batch(&db, 10).unwrap().remove(0);
        fail(&db, &item, "NETWORK_ERROR: unreachable", &config()).unwrap();

        // Re-enqueue: fresh logical operation disregards prior failures
        enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("b")).unwrap();

        let conn = db.conn.lock().unwrap();
        let (retries, next_retry_at, last_error): (i64, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT retry_count, next_retry_at, last_error FROM sync_queue WHERE entity_id = 'o1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(retries, 0);
        assert!(next_retry_at.is_none());
        assert!(last_error.is_none());
    }

    #[test]
    fn test_dequeue_is_fifo_and_marks_in_progress() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        enqueue(&db, EntityType::Product, "p1", SyncAction::Create, &payload("b")).unwrap();
        enqueue(&db, EntityType::Order, "o2", SyncAction::Create, &payload("c")).unwrap();

        let items = dequeue_batch(&db, 2).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].entity_id, "o1");
        assert_eq!(items[1].entity_id, "p1");

        // Dispatched rows are not eligible again until requeued
        let remaining = dequeue_batch(&db, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entity_id, "o2");

        assert_eq!(load_in_flight(&db).unwrap().len(), 3);
    }

    #[test]
    fn test_acknowledge_removes_row() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        let item = dequeue_batch(&db, 1).unwrap().remove(0);

        assert!(acknowledge(&db, &item).unwrap());
        assert_eq!(pending_count(&db), 0);
        assert!(load_in_flight(&db).unwrap().is_empty());
    }

    #[test]
    fn test_acknowledge_after_inflight_coalesce_keeps_newer_payload() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("old")).unwrap();
        let item = dequeue_batch(&db, 1).unwrap().remove(0);

        // User edits again while the old payload is on the wire
        enqueue(&db, EntityType::Order, "o1", SyncAction::Update, &payload("newer")).unwrap();

        assert!(!acknowledge(&db, &item).unwrap());

        let requeued = dequeue_batch(&db, 10).unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].payload.get("customerName").unwrap(), "newer");
    }

    #[test]
    fn test_fail_schedules_backoff_and_blocks_until_due() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        let item = dequeue_batch(&db, 1).unwrap().remove(0);

        let outcome = fail(&db, &item, "NETWORK_ERROR: unreachable", &config()).unwrap();
        assert!(!outcome.abandoned);
        assert!(!outcome.backpressure_deferred);

        // Deferred into the future: not eligible right now
        assert!(dequeue_batch(&db, 10).unwrap().is_empty());
        assert_eq!(pending_count(&db), 1);
        assert!(oldest_next_retry_at(&db).is_some());

        force_eligible(&db, item.id);
        let retried = dequeue_batch(&db, 10).unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retries, 1);
        assert_eq!(
            retried[0].last_error.as_deref(),
            Some("NETWORK_ERROR: unreachable")
        );
        // Backoff doubled from the base delay
        assert_eq!(retried[0].retry_delay_ms, 10_000);
    }

    #[test]
    fn test_retry_exhaustion_abandons_after_fourth_failure() {
        let db = test_db();
        let cfg = config();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();

        for attempt in 1..=4 {
            let item = dequeue_batch(&db, 1).unwrap().remove(0);
            let outcome = fail(&db, &item, "NETWORK_ERROR: unreachable", &cfg).unwrap();
            if attempt < 4 {
                assert!(!outcome.abandoned, "attempt {attempt} should still retry");
                force_eligible(&db, item.id);
            } else {
                assert!(outcome.abandoned, "attempt 4 should abandon (max=3)");
            }
        }

        assert_eq!(pending_count(&db), 0);
        assert_eq!(failed_count(&db), 1);
        assert!(dequeue_batch(&db, 10).unwrap().is_empty());
    }

    #[test]
    fn test_backpressure_defers_without_retry_increment() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        let item = dequeue_batch(&db, 1).unwrap().remove(0);

        let backpressure =
            "Too many requests. Please retry later. (HTTP 429): {\"retry_after_seconds\": 7}";
        let outcome = fail(&db, &item, backpressure, &config()).unwrap();
        assert!(outcome.backpressure_deferred);
        assert!(!outcome.abandoned);

        force_eligible(&db, item.id);
        let retried = dequeue_batch(&db, 10).unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retries, 0);
    }

    #[test]
    fn test_requeue_in_flight_resets_without_increment() {
        let db = test_db();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        enqueue(&db, EntityType::Order, "o2", SyncAction::Create, &payload("b")).unwrap();
        let items = dequeue_batch(&db, 10).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(requeue_in_flight(&db).unwrap(), 2);
        let retried = dequeue_batch(&db, 10).unwrap();
        assert_eq!(retried.len(), 2);
        assert!(retried.iter().all(|i| i.retries == 0));
    }

    #[test]
    fn test_fresh_enqueue_supersedes_abandoned_row() {
        let db = test_db();
        let cfg = config();

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("a")).unwrap();
        for _ in 0..4 {
            let item = dequeue_batch(&db, 1).unwrap().remove(0);
            fail(&db, &item, "NETWORK_ERROR: unreachable", &cfg).unwrap();
            force_eligible(&db, item.id);
        }
        assert_eq!(failed_count(&db), 1);

        enqueue(&db, EntityType::Order, "o1", SyncAction::Create, &payload("b")).unwrap();
        assert_eq!(failed_count(&db), 0);
        assert_eq!(pending_count(&db), 1);

        let item = find_active(&db, EntityType::Order, "o1").unwrap().unwrap();
        assert_eq!(item.retries, 0);
        assert_eq!(item.payload.get("customerName").unwrap(), "b");
    }
}
