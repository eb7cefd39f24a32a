//! Stock Lookup: joins SKUs to the local inventory extract.
//!
//! The extract is refreshed outside the sync engine; this is a pure read
//! model joined by SKU value, not by foreign key.

use crate::model::{SkuKey, StockRecord};
use std::collections::HashMap;

/// On-hand information attached to a resolved line item.
#[derive(Debug, Clone, PartialEq)]
pub struct StockInfo {
    pub quantity_on_hand: i64,
    pub bin_location: String,
    pub unit_cost: f64,
}

#[derive(Debug, Default)]
pub struct StockIndex {
    by_sku: HashMap<String, StockInfo>,
}

impl StockIndex {
    pub fn build(records: Vec<StockRecord>) -> Self {
        let by_sku = records
            .into_iter()
            .map(|r| {
                (
                    r.sku.trim().to_string(),
                    StockInfo {
                        quantity_on_hand: r.quantity,
                        bin_location: r.bin_location,
                        unit_cost: r.unit_cost,
                    },
                )
            })
            .collect();
        Self { by_sku }
    }

    /// Sentinel items never have stock; unknown SKUs return None.
    pub fn lookup(&self, sku: &SkuKey) -> Option<&StockInfo> {
        match sku {
            SkuKey::Sku(s) => self.by_sku.get(s.trim()),
            SkuKey::NoSku => None,
        }
    }

    pub fn len(&self) -> usize {
        self.by_sku.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sku.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sku: &str, qty: i64, bin: &str) -> StockRecord {
        StockRecord {
            sku: sku.into(),
            quantity: qty,
            bin_location: bin.into(),
            unit_cost: 12.5,
        }
    }

    #[test]
    fn lookup_joins_by_trimmed_sku() {
        let index = StockIndex::build(vec![record(" HD-100 ", 4, "A3")]);
        let info = index.lookup(&SkuKey::Sku("HD-100".into())).unwrap();
        assert_eq!(info.quantity_on_hand, 4);
        assert_eq!(info.bin_location, "A3");
    }

    #[test]
    fn sentinel_and_unknown_have_no_stock() {
        let index = StockIndex::build(vec![record("HD-100", 4, "A3")]);
        assert!(index.lookup(&SkuKey::NoSku).is_none());
        assert!(index.lookup(&SkuKey::Sku("HD-999".into())).is_none());
    }
}
