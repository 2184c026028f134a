//! Entity store: authoritative local state for orders and products.
//!
//! Writes are optimistic: `upsert_local` persists immediately with
//! `syncStatus=pending` and the sync engine confirms later. Server
//! confirmations land through `apply_server_state`, which detects whether the
//! local record was mutated again while the operation was in flight and, if
//! so, merges field-by-field instead of clobbering the newer local edit.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::db::DbState;
use crate::types::{Entity, EntityType, Order, Product, SyncStatus};

/// Bookkeeping fields excluded from dirty-detection and merge. The server
/// owns `version`/`lastModifiedAt`; the rest never represents user intent.
const META_FIELDS: &[&str] = &[
    "id",
    "syncStatus",
    "version",
    "lastModifiedAt",
    "updatedAt",
    "createdAt",
];

/// Result of applying server-confirmed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local state now matches the server; entity is `synced`.
    Synced,
    /// The record was re-edited while in flight and the merge kept local
    /// values the server doesn't have; entity is `pending` again.
    PendingLocalEdits,
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Persist a local mutation. Sets `syncStatus=pending`, bumps
/// `updatedAt`/`lastModifiedAt`, clears any recorded error, and leaves
/// `version` unchanged; the server owns version assignment.
pub fn upsert_local(db: &DbState, entity: &mut Entity) -> Result<(), String> {
    entity.set_sync_status(SyncStatus::Pending);
    entity.touch(Utc::now());

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    write_entity_row(&conn, entity, None)?;

    debug!(
        entity_type = entity.entity_type().as_str(),
        entity_id = %entity.client_id(),
        "Entity upserted locally"
    );
    Ok(())
}

/// Remove an entity from the local store. Returns whether a row was deleted.
pub fn delete_local(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<bool, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let deleted = conn
        .execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND client_generated_id = ?2",
            params![entity_type.as_str(), entity_id],
        )
        .map_err(|e| format!("delete entity: {e}"))?;
    Ok(deleted > 0)
}

/// Record a terminal sync failure. The entity stays visible and editable;
/// the error is retained for display and manual retry.
pub fn mark_error(db: &DbState, entity_type: EntityType, entity_id: &str, error: &str) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM entities WHERE entity_type = ?1 AND client_generated_id = ?2",
            params![entity_type.as_str(), entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("load entity for mark_error: {e}"))?;

    let Some(raw) = raw else {
        // Entity already deleted locally (e.g. abandoned delete op); nothing
        // to mark, but the caller still sees success.
        warn!(entity_id, "mark_error: entity not found");
        return Ok(());
    };

    let mut data: Value =
        serde_json::from_str(&raw).map_err(|e| format!("parse entity data: {e}"))?;
    if let Value::Object(obj) = &mut data {
        obj.insert("syncStatus".to_string(), Value::String("error".to_string()));
    }

    conn.execute(
        "UPDATE entities
         SET data = ?1,
             sync_status = 'error',
             last_error = ?2,
             updated_at = datetime('now')
         WHERE entity_type = ?3 AND client_generated_id = ?4",
        params![data.to_string(), error, entity_type.as_str(), entity_id],
    )
    .map_err(|e| format!("mark entity error: {e}"))?;
    Ok(())
}

/// Apply server-confirmed state after a successful or conflicted sync.
///
/// The merge ancestor is the last server-confirmed copy of the record
/// (`base_data`), falling back to `sent_snapshot` (the payload the
/// originating queue item carried) for records the server has never
/// confirmed. Fields the local record changed relative to that ancestor keep
/// their local values; every other field takes the server value. `version`
/// and `lastModifiedAt` always come from the server. The entity becomes
/// `synced` when the merge equals the server state on domain fields, else
/// `pending` so the surviving local edit re-triggers sync.
pub fn apply_server_state(
    db: &DbState,
    entity_type: EntityType,
    server_state: &Value,
    sent_snapshot: Option<&Value>,
) -> Result<ApplyOutcome, String> {
    // Round-trip through the typed entity so malformed server payloads are
    // rejected here rather than persisted.
    let server_entity = Entity::from_value(entity_type, server_state)?;
    let server_value = server_entity.to_value();
    let entity_id = server_entity.client_id().to_string();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT data, base_data FROM entities
             WHERE entity_type = ?1 AND client_generated_id = ?2",
            params![entity_type.as_str(), &entity_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("load entity: {e}"))?;

    let (local_value, base_value): (Option<Value>, Option<Value>) = match row {
        Some((data, base)) => {
            let local =
                serde_json::from_str(&data).map_err(|e| format!("parse entity data: {e}"))?;
            let base = match base {
                Some(raw) => {
                    Some(serde_json::from_str(&raw).map_err(|e| format!("parse base data: {e}"))?)
                }
                None => None,
            };
            (Some(local), base)
        }
        None => (None, None),
    };

    let ancestor = base_value.or_else(|| sent_snapshot.cloned());

    let (merged, outcome) = match (local_value, ancestor) {
        // Unknown locally, or no ancestor to diff against: the server copy
        // is authoritative.
        (None, _) | (Some(_), None) => {
            let mut synced = server_entity;
            synced.set_sync_status(SyncStatus::Synced);
            (synced, ApplyOutcome::Synced)
        }
        (Some(local), Some(base)) => {
            let merged_value = three_way_merge(&server_value, &local, &base);

            let still_dirty = domain_fields(&merged_value) != domain_fields(&server_value);
            let mut merged = Entity::from_value(entity_type, &merged_value)?;
            merged.set_sync_status(if still_dirty {
                SyncStatus::Pending
            } else {
                SyncStatus::Synced
            });
            let outcome = if still_dirty {
                ApplyOutcome::PendingLocalEdits
            } else {
                ApplyOutcome::Synced
            };
            (merged, outcome)
        }
    };

    // The server copy becomes the new merge ancestor either way.
    write_entity_row(&conn, &merged, Some(&server_value))?;

    debug!(
        entity_type = entity_type.as_str(),
        entity_id = %entity_id,
        outcome = ?outcome,
        "Server state applied"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub fn get_entity(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<Option<Entity>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT data FROM entities WHERE entity_type = ?1 AND client_generated_id = ?2",
            params![entity_type.as_str(), entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("load entity: {e}"))?;

    match raw {
        Some(raw) => {
            let value: Value =
                serde_json::from_str(&raw).map_err(|e| format!("parse entity data: {e}"))?;
            Entity::from_value(entity_type, &value).map(Some)
        }
        None => Ok(None),
    }
}

/// Last recorded sync error for an entity, if any.
pub fn get_last_error(db: &DbState, entity_type: EntityType, entity_id: &str) -> Result<Option<String>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        "SELECT last_error FROM entities WHERE entity_type = ?1 AND client_generated_id = ?2",
        params![entity_type.as_str(), entity_id],
        |row| row.get(0),
    )
    .optional()
    .map(|r| r.flatten())
    .map_err(|e| format!("load entity error: {e}"))
}

/// All orders, most recent first. Rows that fail to parse are skipped with a
/// warning rather than failing the whole listing.
pub fn list_orders(db: &DbState) -> Result<Vec<Order>, String> {
    list_entities(db, EntityType::Order)?
        .into_iter()
        .map(|e| match e {
            Entity::Order(o) => Ok(o),
            Entity::Product(_) => Err("unexpected product row in order listing".to_string()),
        })
        .collect()
}

/// All products, most recent first.
pub fn list_products(db: &DbState) -> Result<Vec<Product>, String> {
    list_entities(db, EntityType::Product)?
        .into_iter()
        .map(|e| match e {
            Entity::Product(p) => Ok(p),
            Entity::Order(_) => Err("unexpected order row in product listing".to_string()),
        })
        .collect()
}

fn list_entities(db: &DbState, entity_type: EntityType) -> Result<Vec<Entity>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT client_generated_id, data FROM entities
             WHERE entity_type = ?1
             ORDER BY created_at DESC, client_generated_id",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![entity_type.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .filter_map(|(id, raw)| {
            let value: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Skipping unparseable entity row");
                    return None;
                }
            };
            match Entity::from_value(entity_type, &value) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!(entity_id = %id, error = %e, "Skipping malformed entity row");
                    None
                }
            }
        })
        .collect();

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// Write-through of the serialized entity plus the indexed tracking columns.
/// `base` replaces the stored merge ancestor when given; `None` preserves
/// whatever ancestor the row already has (local writes never move the base).
/// Callers hold the connection lock.
fn write_entity_row(
    conn: &rusqlite::Connection,
    entity: &Entity,
    base: Option<&Value>,
) -> Result<(), String> {
    let data = entity.to_value().to_string();
    let base_data = base.map(|v| v.to_string());
    let last_modified_at = entity.last_modified_at().map(|dt| dt.to_rfc3339());

    conn.execute(
        "INSERT INTO entities (
            client_generated_id, entity_type, data, base_data, sync_status,
            version, last_modified_at, last_error, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, datetime('now'), datetime('now'))
        ON CONFLICT(client_generated_id) DO UPDATE SET
            data = excluded.data,
            base_data = COALESCE(excluded.base_data, entities.base_data),
            sync_status = excluded.sync_status,
            version = excluded.version,
            last_modified_at = excluded.last_modified_at,
            last_error = NULL,
            updated_at = datetime('now')",
        params![
            entity.client_id().to_string(),
            entity.entity_type().as_str(),
            data,
            base_data,
            entity.sync_status().as_str(),
            entity.version(),
            last_modified_at,
        ],
    )
    .map_err(|e| format!("write entity: {e}"))?;
    Ok(())
}

/// Strip bookkeeping fields, leaving only the user-intent payload.
fn domain_fields(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(obj) => obj
            .iter()
            .filter(|(k, _)| !META_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    }
}

/// Field-level three-way merge: fields the local record changed relative to
/// the ancestor keep their local values; everything else takes the server
/// value.
fn three_way_merge(server: &Value, local: &Value, base: &Value) -> Value {
    let mut merged = match server {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };

    let empty = Map::new();
    let local_obj = local.as_object().unwrap_or(&empty);
    let base_obj = base.as_object().unwrap_or(&empty);

    for (key, local_val) in local_obj {
        if META_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if base_obj.get(key) != Some(local_val) {
            merged.insert(key.clone(), local_val.clone());
        }
    }
    // A field removed locally since the ancestor stays removed.
    for key in base_obj.keys() {
        if META_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if !local_obj.contains_key(key) {
            merged.remove(key);
        }
    }

    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::types::{OrderItem, OrderStatus};
    use chrono::{DateTime, Utc};
    use rusqlite::Connection;
    use uuid::Uuid;

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

    fn sample_order() -> Order {
        Order::new(
            "biz-1",
            "Ada",
            vec![OrderItem::new(Uuid::new_v4(), "Espresso", 2.0, 2.5)],
        )
    }

    fn server_copy(order: &Order, version: i64) -> Value {
        let mut server = order.clone();
        server.version = Some(version);
        server.sync_status = SyncStatus::Synced;
        server.last_modified_at = Some(Utc::now());
        serde_json::to_value(&server).unwrap()
    }

    #[test]
    fn test_upsert_local_sets_pending_and_bumps_timestamps() {
        let db = test_db();
        let mut order = sample_order();
        order.sync_status = SyncStatus::Synced;
        order.version = Some(3);
        let before: DateTime<Utc> = order.updated_at;

        let mut entity = Entity::Order(order.clone());
        upsert_local(&db, &mut entity).unwrap();

        let stored = get_entity(&db, EntityType::Order, &order.client_generated_id.to_string())
            .unwrap()
            .unwrap();
        let Entity::Order(stored) = stored else {
            panic!("expected order");
        };
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        // Server-owned version untouched by local writes
        assert_eq!(stored.version, Some(3));
        assert!(stored.updated_at >= before);
        assert!(stored.last_modified_at.unwrap() >= before);
    }

    #[test]
    fn test_apply_server_state_clean_local_becomes_synced() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        let mut entity = Entity::Order(order.clone());
        upsert_local(&db, &mut entity).unwrap();
        let snapshot = entity.to_value();

        let server = server_copy(&order, 1);
        let outcome =
            apply_server_state(&db, EntityType::Order, &server, Some(&snapshot)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Synced);

        let stored = get_entity(&db, EntityType::Order, &id).unwrap().unwrap();
        assert_eq!(stored.sync_status(), SyncStatus::Synced);
        assert_eq!(stored.version(), Some(1));
        // Field values now match the server record
        let Entity::Order(stored) = stored else {
            panic!("expected order");
        };
        assert_eq!(stored.customer_name, order.customer_name);
        assert_eq!(stored.total, order.total);
    }

    #[test]
    fn test_apply_server_state_unknown_entity_is_inserted_synced() {
        let db = test_db();
        let order = sample_order();
        let server = server_copy(&order, 5);

        let outcome = apply_server_state(&db, EntityType::Order, &server, None).unwrap();
        assert_eq!(outcome, ApplyOutcome::Synced);

        let stored = get_entity(&db, EntityType::Order, &order.client_generated_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_status(), SyncStatus::Synced);
        assert_eq!(stored.version(), Some(5));
    }

    #[test]
    fn test_apply_server_state_keeps_redirtied_fields() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        let mut entity = Entity::Order(order.clone());
        upsert_local(&db, &mut entity).unwrap();
        let snapshot = entity.to_value();

        // User edits notes again while the original payload is in flight
        let Entity::Order(mut edited) = entity.clone() else {
            panic!("expected order");
        };
        edited.notes = Some("ring the back bell".to_string());
        let mut edited_entity = Entity::Order(edited);
        upsert_local(&db, &mut edited_entity).unwrap();

        // Server confirms the original payload with a new status of its own
        let mut server_order = order.clone();
        server_order.status = OrderStatus::InProgress;
        let server = server_copy(&server_order, 2);

        let outcome =
            apply_server_state(&db, EntityType::Order, &server, Some(&snapshot)).unwrap();
        assert_eq!(outcome, ApplyOutcome::PendingLocalEdits);

        let Entity::Order(stored) = get_entity(&db, EntityType::Order, &id).unwrap().unwrap()
        else {
            panic!("expected order");
        };
        // Server-changed field came through, local re-edit survived
        assert_eq!(stored.status, OrderStatus::InProgress);
        assert_eq!(stored.notes.as_deref(), Some("ring the back bell"));
        assert_eq!(stored.version, Some(2));
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_apply_server_state_merges_against_last_confirmed_base() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        // Server confirms version 3; that copy becomes the merge ancestor
        let server_v3 = server_copy(&order, 3);
        apply_server_state(&db, EntityType::Order, &server_v3, None).unwrap();

        // Local edit on top of the confirmed state
        let Entity::Order(mut edited) = get_entity(&db, EntityType::Order, &id).unwrap().unwrap()
        else {
            panic!("expected order");
        };
        edited.notes = Some("gate code 4711".to_string());
        let mut entity = Entity::Order(edited);
        upsert_local(&db, &mut entity).unwrap();

        // Server has meanwhile moved to version 4 with its own status change
        let mut server_order = order.clone();
        server_order.status = OrderStatus::InProgress;
        let server_v4 = server_copy(&server_order, 4);

        let outcome =
            apply_server_state(&db, EntityType::Order, &server_v4, Some(&entity.to_value()))
                .unwrap();
        assert_eq!(outcome, ApplyOutcome::PendingLocalEdits);

        let Entity::Order(stored) = get_entity(&db, EntityType::Order, &id).unwrap().unwrap()
        else {
            panic!("expected order");
        };
        // Local edit survives, server-only change comes through
        assert_eq!(stored.notes.as_deref(), Some("gate code 4711"));
        assert_eq!(stored.status, OrderStatus::InProgress);
        assert_eq!(stored.version, Some(4));
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_apply_server_state_moot_edit_becomes_synced() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        let mut entity = Entity::Order(order.clone());
        upsert_local(&db, &mut entity).unwrap();
        let snapshot = entity.to_value();

        // Local re-edit sets the same value the server already has
        let Entity::Order(mut edited) = entity.clone() else {
            panic!("expected order");
        };
        edited.status = OrderStatus::Completed;
        let mut edited_entity = Entity::Order(edited);
        upsert_local(&db, &mut edited_entity).unwrap();

        let mut server_order = order.clone();
        server_order.status = OrderStatus::Completed;
        let server = server_copy(&server_order, 4);

        let outcome =
            apply_server_state(&db, EntityType::Order, &server, Some(&snapshot)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Synced);

        let stored = get_entity(&db, EntityType::Order, &id).unwrap().unwrap();
        assert_eq!(stored.sync_status(), SyncStatus::Synced);
        assert_eq!(stored.version(), Some(4));
    }

    #[test]
    fn test_mark_error_keeps_entity_visible() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        let mut entity = Entity::Order(order);
        upsert_local(&db, &mut entity).unwrap();

        mark_error(&db, EntityType::Order, &id, "NETWORK_ERROR: unreachable").unwrap();

        let stored = get_entity(&db, EntityType::Order, &id).unwrap().unwrap();
        assert_eq!(stored.sync_status(), SyncStatus::Error);
        assert_eq!(
            get_last_error(&db, EntityType::Order, &id).unwrap().as_deref(),
            Some("NETWORK_ERROR: unreachable")
        );
        assert_eq!(list_orders(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_local_removes_row() {
        let db = test_db();
        let order = sample_order();
        let id = order.client_generated_id.to_string();

        let mut entity = Entity::Order(order);
        upsert_local(&db, &mut entity).unwrap();

        assert!(delete_local(&db, EntityType::Order, &id).unwrap());
        assert!(get_entity(&db, EntityType::Order, &id).unwrap().is_none());
        assert!(!delete_local(&db, EntityType::Order, &id).unwrap());
    }
}
