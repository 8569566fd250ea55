use super::{Cookie, SessionStore, StorageArea, StoreData};
use crate::error::{AuthError, Result};
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};

/// Process-local store, the equivalent of a single browser profile.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| AuthError::Storage("memory store lock poisoned".to_string()))
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, area: StorageArea, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.area(area).get(key).cloned())
    }

    fn set(&self, area: StorageArea, key: &str, value: &str) -> Result<()> {
        self.lock()?
            .area_mut(area)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, area: StorageArea, key: &str) -> Result<()> {
        self.lock()?.area_mut(area).remove(key);
        Ok(())
    }

    fn keys(&self, area: StorageArea) -> Result<Vec<String>> {
        Ok(self.lock()?.area(area).keys().cloned().collect())
    }

    fn clear(&self, area: StorageArea) -> Result<()> {
        self.lock()?.area_mut(area).clear();
        Ok(())
    }

    fn cookies(&self) -> Result<Vec<Cookie>> {
        Ok(self.lock()?.live_cookies(Utc::now()))
    }

    fn set_cookie(&self, cookie: Cookie) -> Result<()> {
        self.lock()?.put_cookie(cookie, Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() -> Result<()> {
        let store = MemoryStore::new();
        store.set(StorageArea::Local, "theme", "dark")?;
        assert_eq!(
            store.get(StorageArea::Local, "theme")?,
            Some("dark".to_string())
        );
        assert_eq!(store.get(StorageArea::Session, "theme")?, None);

        store.remove(StorageArea::Local, "theme")?;
        assert!(store.keys(StorageArea::Local)?.is_empty());
        Ok(())
    }

    #[test]
    fn clear_only_touches_one_area() -> Result<()> {
        let store = MemoryStore::new();
        store.set(StorageArea::Local, "a", "1")?;
        store.set(StorageArea::Session, "b", "2")?;
        store.clear(StorageArea::Session)?;
        assert_eq!(store.keys(StorageArea::Local)?, vec!["a".to_string()]);
        assert!(store.keys(StorageArea::Session)?.is_empty());
        Ok(())
    }
}
