//! Document-scoped cache of the header bill of materials.

use std::collections::HashMap;

use crate::services::{Bom, BomItem};

/// Items of the document's BOM keyed by item code.
///
/// Belongs to one form; replaced when the document's BOM reference changes.
#[derive(Debug, Default)]
pub struct BomCache {
    name: Option<String>,
    items: HashMap<String, BomItem>,
}

impl BomCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_load(&self, bom_no: &str) -> bool {
        self.name.as_deref() != Some(bom_no)
    }

    /// Clear the cache when it holds a different BOM. Returns whether it was cleared.
    pub fn invalidate_if_changed(&mut self, bom_no: Option<&str>) -> bool {
        if self.name.is_some() && self.name.as_deref() != bom_no {
            self.clear();
            return true;
        }
        false
    }

    pub fn store(&mut self, bom: Bom) {
        self.items = bom
            .items
            .into_iter()
            .map(|item| (item.item_code.clone(), item))
            .collect();
        self.name = Some(bom.name);
    }

    pub fn item(&self, item_code: &str) -> Option<&BomItem> {
        self.items.get(item_code)
    }

    pub fn clear(&mut self) {
        self.name = None;
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn bom(name: &str) -> Bom {
        let mut flour = BomItem::new("FLOUR", dec!(2));
        flour.allow_alternative_item = true;
        Bom {
            name: name.to_string(),
            items: vec![flour],
        }
    }

    #[test]
    fn keeps_cache_for_same_reference() {
        let mut cache = BomCache::new();
        cache.store(bom("BOM-BREAD-001"));

        assert!(!cache.invalidate_if_changed(Some("BOM-BREAD-001")));
        assert!(!cache.needs_load("BOM-BREAD-001"));
        assert!(cache.item("FLOUR").is_some_and(|i| i.allow_alternative_item));
    }

    #[test]
    fn changed_reference_clears_cache() {
        let mut cache = BomCache::new();
        cache.store(bom("BOM-BREAD-001"));

        assert!(cache.invalidate_if_changed(Some("BOM-BREAD-002")));
        assert!(cache.needs_load("BOM-BREAD-001"));
        assert!(cache.item("FLOUR").is_none());
        assert!(cache.needs_load("BOM-BREAD-002"));
    }
}
