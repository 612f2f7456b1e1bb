//! Keyword name registry.
//!
//! Keywords map case-insensitive names to bit indices in the record's
//! inline keyword bitmap. Names are never removed, so a bit index stays
//! valid for the lifetime of the index.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::ondisk::KEYWORDS_MAX;

#[derive(Debug, Default)]
pub struct Keywords {
    inner: RwLock<KeywordsInner>,
}

#[derive(Debug, Default)]
struct KeywordsInner {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl Keywords {
    pub(crate) fn new() -> Keywords {
        Keywords::default()
    }

    /// Bit index of `name`, if registered.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.inner
            .read()
            .by_name
            .get(&name.to_ascii_lowercase())
            .copied()
    }

    /// Bit index of `name`, registering it if new. `None` when the inline
    /// bitmap has no bits left.
    pub fn lookup_or_create(&self, name: &str) -> Option<usize> {
        assert!(!name.is_empty());
        if let Some(idx) = self.lookup(name) {
            return Some(idx);
        }
        let mut inner = self.inner.write();
        let key = name.to_ascii_lowercase();
        if let Some(idx) = inner.by_name.get(&key) {
            return Some(*idx);
        }
        let idx = inner.names.len();
        if idx >= KEYWORDS_MAX {
            return None;
        }
        inner.names.push(name.to_string());
        inner.by_name.insert(key, idx);
        Some(idx)
    }

    /// Registered names in bit-index order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().names.clone()
    }

    /// Number of registered keywords.
    pub fn count(&self) -> usize {
        self.inner.read().names.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let keywords = Keywords::new();
        let idx = keywords.lookup_or_create("NonJunk").unwrap();
        assert_eq!(keywords.lookup("nonjunk"), Some(idx));
        assert_eq!(keywords.lookup_or_create("NONJUNK"), Some(idx));
        assert_eq!(keywords.names(), vec!["NonJunk".to_string()]);
    }

    #[test]
    fn bitmap_capacity_is_bounded() {
        let keywords = Keywords::new();
        for i in 0..KEYWORDS_MAX {
            assert_eq!(keywords.lookup_or_create(&format!("kw{i}")), Some(i));
        }
        assert_eq!(keywords.lookup_or_create("one-too-many"), None);
        // Existing names still resolve.
        assert_eq!(keywords.lookup("kw0"), Some(0));
    }
}
