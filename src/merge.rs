//! Progress Merge Engine.
//!
//! Combines three independently-updated sets — the mirrored line items, the
//! locally-owned progress ledger and the stock extract — into one resolved
//! fulfillment state per item. Read-only: the ledger is only ever written
//! through `db::repo::record_progress`.

use crate::model::{Order, OrderLineItem, ProgressKey, ProgressRecord, SkuKey, Stage};
use crate::stock::{StockIndex, StockInfo};
use std::collections::{HashMap, HashSet};

/// One line item with its ledger entry and stock info resolved.
#[derive(Debug, Clone)]
pub struct MergedItem {
    pub sku: SkuKey,
    pub title: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub stage: Stage,
    pub notes: String,
    pub qty_required: i64,
    pub qty_picked: i64,
    pub partial: bool,
    pub stock: Option<StockInfo>,
    /// True for placeholder items synthesized from a sentinel ledger entry
    /// with no physical blank-SKU line item behind it.
    pub synthesized: bool,
}

impl MergedItem {
    pub fn is_picked(&self) -> bool {
        self.qty_picked >= self.qty_required
    }
}

#[derive(Debug, Clone)]
pub struct MergedOrder {
    pub order: Order,
    pub items: Vec<MergedItem>,
    pub is_complete: bool,
}

/// Resolve every line item of the given cohort against the full ledger.
/// Every item gets exactly one stage; items without a ledger entry get the
/// default (To Pick, nothing picked).
pub fn merge_orders(
    orders: &[Order],
    items: &[OrderLineItem],
    ledger: &[ProgressRecord],
    stock: &StockIndex,
) -> Vec<MergedOrder> {
    let ledger_map: HashMap<ProgressKey, &ProgressRecord> =
        ledger.iter().map(|rec| (rec.key(), rec)).collect();

    let mut items_by_order: HashMap<i64, Vec<&OrderLineItem>> = HashMap::new();
    for item in items {
        items_by_order.entry(item.order_id).or_default().push(item);
    }

    orders
        .iter()
        .map(|order| {
            let order_items = items_by_order.get(&order.id).map_or(&[][..], Vec::as_slice);
            let mut merged: Vec<MergedItem> = order_items
                .iter()
                .map(|&item| resolve_item(order.remote_id, item, &ledger_map, stock))
                .collect();

            // A sentinel ledger entry with no physical blank-SKU item marks a
            // part added by hand; keep it visible as a placeholder.
            let has_blank_item = merged.iter().any(|m| m.sku.is_no_sku() && !m.synthesized);
            if !has_blank_item {
                let key = ProgressKey::new(order.remote_id, SkuKey::NoSku);
                if let Some(&rec) = ledger_map.get(&key) {
                    merged.push(synthesize_placeholder(rec));
                }
            }

            let is_complete = !merged.is_empty() && merged.iter().all(MergedItem::is_picked);
            MergedOrder {
                order: order.clone(),
                items: merged,
                is_complete,
            }
        })
        .collect()
}

fn resolve_item(
    remote_order_id: i64,
    item: &OrderLineItem,
    ledger_map: &HashMap<ProgressKey, &ProgressRecord>,
    stock: &StockIndex,
) -> MergedItem {
    let sku = SkuKey::from_raw(item.sku.as_deref());
    let key = ProgressKey::new(remote_order_id, sku.clone());
    let rec = ledger_map.get(&key);

    let (stage, notes, qty_required, qty_picked, partial) = match rec {
        Some(rec) => (
            rec.stage,
            rec.notes.clone(),
            rec.qty_required.unwrap_or(item.quantity),
            rec.qty_picked,
            rec.partial,
        ),
        None => (Stage::ToPick, String::new(), item.quantity, 0, false),
    };

    MergedItem {
        stock: stock.lookup(&sku).cloned(),
        sku,
        title: item.title.clone(),
        quantity: item.quantity,
        unit_price: item.unit_price,
        stage,
        notes,
        qty_required,
        qty_picked,
        partial,
        synthesized: false,
    }
}

fn synthesize_placeholder(rec: &ProgressRecord) -> MergedItem {
    MergedItem {
        sku: SkuKey::NoSku,
        title: String::new(),
        quantity: 1,
        unit_price: 0.0,
        stage: rec.stage,
        notes: rec.notes.clone(),
        qty_required: rec.qty_required.unwrap_or(1),
        qty_picked: rec.qty_picked,
        partial: rec.partial,
        stock: None,
        synthesized: true,
    }
}

/// Report-view filter: only orders carrying at least one item at `stage` are
/// shown in that stage's view.
pub fn orders_in_stage(merged: &[MergedOrder], stage: Stage) -> Vec<&MergedOrder> {
    merged
        .iter()
        .filter(|order| order.items.iter().any(|item| item.stage == stage))
        .collect()
}

/// Stages present across a merged cohort, useful for report navigation.
pub fn stages_present(merged: &[MergedOrder]) -> HashSet<Stage> {
    merged
        .iter()
        .flat_map(|order| order.items.iter().map(|item| item.stage))
        .collect()
}
