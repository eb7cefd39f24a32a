use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel stored for line items without a real part number. Only the SQL
/// and display boundaries ever see this string; everything else goes through
/// [`SkuKey`].
pub const NO_SKU: &str = "No SKU";

/// Position of one order line item in the fulfillment workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    ToPick,
    Picking,
    Picked,
    ToOrder,
    Ordered,
    ToDispatch,
    Fulfilled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ToPick => "To Pick",
            Stage::Picking => "Picking",
            Stage::Picked => "Picked",
            Stage::ToOrder => "To Order",
            Stage::Ordered => "Ordered",
            Stage::ToDispatch => "To Dispatch",
            Stage::Fulfilled => "Fulfilled",
        }
    }

    /// Case-insensitive parse. Stage strings are normalized here, once; all
    /// comparisons past this boundary are exact.
    pub fn parse(s: &str) -> Option<Stage> {
        match s.trim().to_ascii_lowercase().as_str() {
            "to pick" => Some(Stage::ToPick),
            "picking" => Some(Stage::Picking),
            "picked" => Some(Stage::Picked),
            "to order" => Some(Stage::ToOrder),
            "ordered" => Some(Stage::Ordered),
            "to dispatch" => Some(Stage::ToDispatch),
            "fulfilled" => Some(Stage::Fulfilled),
            _ => None,
        }
    }
}

/// Key half identifying a line item within an order: a real part number or
/// the blank-SKU sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SkuKey {
    Sku(String),
    NoSku,
}

impl SkuKey {
    /// Normalize a raw SKU field: `None` and whitespace-only both map to the
    /// sentinel variant.
    pub fn from_raw(raw: Option<&str>) -> SkuKey {
        match raw {
            Some(s) if !s.trim().is_empty() => SkuKey::Sku(s.trim().to_string()),
            _ => SkuKey::NoSku,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SkuKey::Sku(s) => s,
            SkuKey::NoSku => NO_SKU,
        }
    }

    pub fn is_no_sku(&self) -> bool {
        matches!(self, SkuKey::NoSku)
    }
}

/// Composite key addressing one progress ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProgressKey {
    pub remote_order_id: i64,
    pub sku: SkuKey,
}

impl ProgressKey {
    pub fn new(remote_order_id: i64, sku: SkuKey) -> Self {
        Self {
            remote_order_id,
            sku,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FulfillmentStatus {
    Unfulfilled,
    PartiallyFulfilled,
    Fulfilled,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Unfulfilled => "unfulfilled",
            FulfillmentStatus::PartiallyFulfilled => "partially_fulfilled",
            FulfillmentStatus::Fulfilled => "fulfilled",
        }
    }

    pub fn parse(s: &str) -> Option<FulfillmentStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unfulfilled" | "" | "null" => Some(FulfillmentStatus::Unfulfilled),
            "partial" | "partially_fulfilled" => Some(FulfillmentStatus::PartiallyFulfilled),
            "fulfilled" => Some(FulfillmentStatus::Fulfilled),
            _ => None,
        }
    }
}

/// Persisted "is a sync running" flag. Written only by the pipeline, read by
/// any process through the settings keyspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Importing,
    Background,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Importing => "importing",
            SyncStatus::Background => "background",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<SyncStatus> {
        match s.trim() {
            "idle" => Some(SyncStatus::Idle),
            "importing" => Some(SyncStatus::Importing),
            "background" => Some(SyncStatus::Background),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SyncStatus::Importing | SyncStatus::Background)
    }
}

/// States of the complete-refresh workflow. One state machine, one
/// transition function (`verify::step`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Deleting,
    Importing,
    Background,
    Verifying,
    RecoveryMode,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub remote_id: i64,
    pub number: String,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub fulfillment_status: FulfillmentStatus,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub id: i64,
    pub order_id: i64,
    pub sku: Option<String>,
    pub title: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub location_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockRecord {
    pub sku: String,
    pub quantity: i64,
    pub bin_location: String,
    pub unit_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub remote_order_id: i64,
    pub sku: SkuKey,
    pub stage: Stage,
    pub notes: String,
    pub qty_required: Option<i64>,
    pub qty_picked: i64,
    pub partial: bool,
    pub vendor_line_id: Option<String>,
    pub dealer_po: Option<String>,
}

impl ProgressRecord {
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.remote_order_id, self.sku.clone())
    }
}
