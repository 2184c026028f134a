//! Core data model: orders, products, and sync queue rows.
//!
//! All entities carry the same conflict-tracking fields (`syncStatus`,
//! `version`, `lastModifiedAt`). `clientGeneratedId` is assigned locally at
//! creation, never changes, and is the idempotency key for retried sync
//! operations. Wire format is camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Local sync state of an entity. Defaults to `Pending` so payloads from the
/// server, which does not track client sync state, deserialize cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Business state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Kind of entity a queue row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Order,
    Product,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::Product => "product",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "order" => Ok(EntityType::Order),
            "product" => Ok(EntityType::Product),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Remote operation carried by a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(format!("unknown sync action: {other}")),
        }
    }
}

/// Queue row lifecycle. `Failed` rows are abandoned: excluded from dequeue,
/// kept for display and manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "pending" => Ok(QueueStatus::Pending),
            "in_progress" => Ok(QueueStatus::InProgress),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// A line item. `total` is derived; use the mutators to keep the
/// `total == quantity * unit_price` invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total: f64,
}

impl OrderItem {
    pub fn new(product_id: Uuid, product_name: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        Self {
            product_id,
            product_name: product_name.into(),
            quantity,
            unit_price,
            total: quantity * unit_price,
        }
    }

    pub fn set_quantity(&mut self, quantity: f64) {
        self.quantity = quantity;
        self.total = self.quantity * self.unit_price;
    }

    pub fn set_unit_price(&mut self, unit_price: f64) {
        self.unit_price = unit_price;
        self.total = self.quantity * self.unit_price;
    }
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Storage-assigned local row id. Never synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Stable client-side identifier; the idempotency key for upserts.
    pub client_generated_id: Uuid,
    pub business_id: String,
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    pub items: Vec<OrderItem>,
    pub total: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    /// Server-assigned, monotonically increasing per accepted write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Wall-clock of the last local mutation, used for conflict comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(business_id: impl Into<String>, customer_name: impl Into<String>, items: Vec<OrderItem>) -> Self {
        let now = Utc::now();
        let total = items.iter().map(|i| i.total).sum();
        Self {
            id: None,
            client_generated_id: Uuid::new_v4(),
            business_id: business_id.into(),
            customer_name: customer_name.into(),
            customer_phone: None,
            customer_email: None,
            items,
            total,
            status: OrderStatus::Pending,
            delivery_date: None,
            notes: None,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
            modified_by: None,
            version: None,
            last_modified_at: Some(now),
        }
    }

    /// Recompute `total` from the line items. Call after mutating `items`.
    pub fn recalculate_total(&mut self) {
        self.total = self.items.iter().map(|i| i.total).sum();
    }
}

// ---------------------------------------------------------------------------
// Product
// ---------------------------------------------------------------------------

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub client_generated_id: Uuid,
    pub business_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price: f64,
    pub is_active: bool,
    #[serde(default)]
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl Product {
    pub fn new(business_id: impl Into<String>, name: impl Into<String>, price: f64) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            client_generated_id: Uuid::new_v4(),
            business_id: business_id.into(),
            name: name.into(),
            description: None,
            price,
            is_active: true,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
            modified_by: None,
            version: None,
            last_modified_at: Some(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Tagged union over the syncable entity kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Order(Order),
    Product(Product),
}

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Order(_) => EntityType::Order,
            Entity::Product(_) => EntityType::Product,
        }
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            Entity::Order(o) => o.client_generated_id,
            Entity::Product(p) => p.client_generated_id,
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        match self {
            Entity::Order(o) => o.sync_status,
            Entity::Product(p) => p.sync_status,
        }
    }

    pub fn set_sync_status(&mut self, status: SyncStatus) {
        match self {
            Entity::Order(o) => o.sync_status = status,
            Entity::Product(p) => p.sync_status = status,
        }
    }

    pub fn version(&self) -> Option<i64> {
        match self {
            Entity::Order(o) => o.version,
            Entity::Product(p) => p.version,
        }
    }

    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Order(o) => o.last_modified_at,
            Entity::Product(p) => p.last_modified_at,
        }
    }

    /// Bump the mutation timestamps. Leaves `version` alone: the server owns
    /// version assignment.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        match self {
            Entity::Order(o) => {
                o.updated_at = now;
                o.last_modified_at = Some(now);
            }
            Entity::Product(p) => {
                p.updated_at = now;
                p.last_modified_at = Some(now);
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Entity::Order(o) => serde_json::to_value(o).unwrap_or(Value::Null),
            Entity::Product(p) => serde_json::to_value(p).unwrap_or(Value::Null),
        }
    }

    pub fn from_value(entity_type: EntityType, value: &Value) -> Result<Self, String> {
        match entity_type {
            EntityType::Order => serde_json::from_value(value.clone())
                .map(Entity::Order)
                .map_err(|e| format!("deserialize order: {e}")),
            EntityType::Product => serde_json::from_value(value.clone())
                .map(Entity::Product)
                .map_err(|e| format!("deserialize product: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync queue row
// ---------------------------------------------------------------------------

/// A pending remote operation, as persisted in `sync_queue`.
#[derive(Debug, Clone)]
pub struct SyncQueueItem {
    pub id: i64,
    pub entity_type: EntityType,
    /// The owning entity's `clientGeneratedId`.
    pub entity_id: String,
    pub action: SyncAction,
    /// Entity snapshot at enqueue time (null for nothing-to-send cases).
    pub payload: Value,
    /// Unique per active row; sent to the remote API for request dedup.
    pub idempotency_key: String,
    pub status: QueueStatus,
    /// Count of failed attempts.
    pub retries: i64,
    pub last_error: Option<String>,
    /// Enqueue time (RFC 3339), refreshed on coalesce.
    pub enqueued_at: String,
    pub next_retry_at: Option<String>,
    pub retry_delay_ms: i64,
    /// Bumped on every coalesce; guards acknowledge against dropping a
    /// payload that changed while the item was in flight.
    pub rev: i64,
}

impl SyncQueueItem {
    /// Version the payload snapshot claims, submitted as the expected prior
    /// version for conflict detection.
    pub fn expected_version(&self) -> Option<i64> {
        self.payload.get("version").and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_item_total_invariant() {
        let mut item = OrderItem::new(Uuid::new_v4(), "Espresso", 3.0, 2.5);
        assert_eq!(item.total, 7.5);

        item.set_quantity(4.0);
        assert_eq!(item.total, 10.0);

        item.set_unit_price(3.0);
        assert_eq!(item.total, 12.0);
    }

    #[test]
    fn test_order_new_computes_total_and_defaults() {
        let items = vec![
            OrderItem::new(Uuid::new_v4(), "Espresso", 2.0, 2.5),
            OrderItem::new(Uuid::new_v4(), "Croissant", 1.0, 3.0),
        ];
        let order = Order::new("biz-1", "Ada", items);

        assert_eq!(order.total, 8.0);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.sync_status, SyncStatus::Pending);
        assert!(order.version.is_none());
        assert!(order.last_modified_at.is_some());
    }

    #[test]
    fn test_order_serializes_camel_case() {
        let order = Order::new("biz-1", "Ada", vec![]);
        let value = serde_json::to_value(&order).unwrap();

        assert!(value.get("clientGeneratedId").is_some());
        assert!(value.get("businessId").is_some());
        assert!(value.get("syncStatus").is_some());
        assert_eq!(value.get("syncStatus").unwrap(), "pending");
        // Unset server-owned fields are omitted, not null
        assert!(value.get("version").is_none());
    }

    #[test]
    fn test_enum_parse_round_trips() {
        for status in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Error] {
            assert_eq!(SyncStatus::parse(status.as_str()).unwrap(), status);
        }
        for action in [SyncAction::Create, SyncAction::Update, SyncAction::Delete] {
            assert_eq!(SyncAction::parse(action.as_str()).unwrap(), action);
        }
        for et in [EntityType::Order, EntityType::Product] {
            assert_eq!(EntityType::parse(et.as_str()).unwrap(), et);
        }
        assert!(SyncStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_entity_round_trip_through_value() {
        let product = Product::new("biz-1", "Beans", 12.0);
        let entity = Entity::Product(product.clone());
        let value = entity.to_value();

        let back = Entity::from_value(EntityType::Product, &value).unwrap();
        assert_eq!(back, entity);
        assert_eq!(back.client_id(), product.client_generated_id);
    }
}
