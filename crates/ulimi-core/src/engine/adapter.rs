//! LoRA adapter name resolution.

use std::collections::HashMap;

/// Maps registered adapter names to dense numeric ids. Id 0 is reserved for
/// the base model (no adapter).
#[derive(Debug, Default)]
pub struct AdapterManager {
    ids: HashMap<String, u32>,
}

impl AdapterManager {
    pub fn new(adapter_names: impl IntoIterator<Item = String>) -> Self {
        let mut ids = HashMap::new();
        for name in adapter_names {
            let next = ids.len() as u32 + 1;
            ids.entry(name).or_insert(next);
        }
        Self { ids }
    }

    /// Registered adapters plus the base model.
    pub fn num_adapters(&self) -> usize {
        self.ids.len() + 1
    }

    pub fn get_adapter_id(&self, name: Option<&str>) -> u32 {
        name.and_then(|n| self.ids.get(n).copied()).unwrap_or(0)
    }

    pub fn get_adapter_ids(&self, names: &[Option<&str>]) -> Vec<u32> {
        names.iter().map(|name| self.get_adapter_id(*name)).collect()
    }
}
