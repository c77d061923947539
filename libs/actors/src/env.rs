//! Node environment table
//!
//! String key/values visible to every service through `GETENV`/`SETENV`.
//! A key can be set once.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct EnvTable {
    table: RwLock<HashMap<String, String>>,
}

impl EnvTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.table.read().get(key).cloned()
    }

    /// Set `key` unless it already has a value; returns whether it was set
    pub fn set(&self, key: &str, value: &str) -> bool {
        let mut table = self.table.write();
        if table.contains_key(key) {
            return false;
        }
        table.insert(key.to_string(), value.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_wins() {
        let env = EnvTable::new();
        assert!(env.get("harbor").is_none());
        assert!(env.set("harbor", "1"));
        assert!(!env.set("harbor", "2"));
        assert_eq!(env.get("harbor").as_deref(), Some("1"));
        assert_eq!(env.len(), 1);
    }
}
