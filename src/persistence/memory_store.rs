// 内存会话存储

use super::{SessionRecord, SessionStore};
use crate::error::Result;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: DashMap<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    fn set(&self, key: &str, record: &SessionRecord) -> Result<()> {
        self.records.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = MemorySessionStore::new();
        assert!(store.get("b/o").unwrap().is_none());

        store.set("b/o", &SessionRecord::new("uri-1", None)).unwrap();
        assert_eq!(store.get("b/o").unwrap().unwrap().uri, "uri-1");

        // 后写者生效
        store.set("b/o", &SessionRecord::new("uri-2", None)).unwrap();
        assert_eq!(store.get("b/o").unwrap().unwrap().uri, "uri-2");
        assert_eq!(store.len(), 1);

        store.delete("b/o").unwrap();
        store.delete("b/o").unwrap();
        assert!(store.is_empty());
    }
}
