//! Client-side session store: two key/value areas (`Local` survives restarts,
//! `Session` is per-run) plus a cookie jar. The identity service persists its
//! credentials here, but any code path may read or clear it, so consumers must
//! treat its contents as untrusted.

pub mod file;
pub mod memory;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    Local,
    Session,
}

impl StorageArea {
    pub const ALL: [Self; 2] = [Self::Local, Self::Session];
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: default_cookie_path(),
            expires: None,
        }
    }

    /// The same cookie rewritten with an expiry in the past.
    #[must_use]
    pub fn expired(&self) -> Self {
        Self {
            name: self.name.clone(),
            value: String::new(),
            path: self.path.clone(),
            expires: DateTime::from_timestamp(0, 0),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

pub trait SessionStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing medium cannot be read.
    fn get(&self, area: StorageArea, key: &str) -> Result<Option<String>>;

    /// # Errors
    /// Returns an error if the backing medium cannot be written.
    fn set(&self, area: StorageArea, key: &str, value: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the backing medium cannot be written.
    fn remove(&self, area: StorageArea, key: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the backing medium cannot be read.
    fn keys(&self, area: StorageArea) -> Result<Vec<String>>;

    /// # Errors
    /// Returns an error if the backing medium cannot be written.
    fn clear(&self, area: StorageArea) -> Result<()>;

    /// Live (non-expired) cookies.
    ///
    /// # Errors
    /// Returns an error if the backing medium cannot be read.
    fn cookies(&self) -> Result<Vec<Cookie>>;

    /// Stores a cookie; one whose expiry has passed is dropped from the jar.
    ///
    /// # Errors
    /// Returns an error if the backing medium cannot be written.
    fn set_cookie(&self, cookie: Cookie) -> Result<()>;
}

/// Document shared by the in-memory and file-backed stores.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    local: BTreeMap<String, String>,
    #[serde(default)]
    session: BTreeMap<String, String>,
    #[serde(default)]
    cookies: BTreeMap<String, Cookie>,
}

impl StoreData {
    pub(crate) fn area(&self, area: StorageArea) -> &BTreeMap<String, String> {
        match area {
            StorageArea::Local => &self.local,
            StorageArea::Session => &self.session,
        }
    }

    pub(crate) fn area_mut(&mut self, area: StorageArea) -> &mut BTreeMap<String, String> {
        match area {
            StorageArea::Local => &mut self.local,
            StorageArea::Session => &mut self.session,
        }
    }

    pub(crate) fn live_cookies(&self, now: DateTime<Utc>) -> Vec<Cookie> {
        self.cookies
            .values()
            .filter(|cookie| !cookie.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub(crate) fn put_cookie(&mut self, cookie: Cookie, now: DateTime<Utc>) {
        if cookie.is_expired_at(now) {
            self.cookies.remove(&cookie.name);
        } else {
            self.cookies.insert(cookie.name.clone(), cookie);
        }
    }

    /// Drops the per-run area, as a fresh browser tab would.
    pub(crate) fn without_session_area(mut self) -> Self {
        self.session.clear();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_cookie_is_removed_from_the_jar() {
        let now = Utc::now();
        let mut data = StoreData::default();
        let cookie = Cookie::new("sb-access-token", "abc");
        data.put_cookie(cookie.clone(), now);
        assert_eq!(data.live_cookies(now), vec![cookie.clone()]);

        data.put_cookie(cookie.expired(), now);
        assert!(data.live_cookies(now).is_empty());
    }

    #[test]
    fn areas_are_independent() {
        let mut data = StoreData::default();
        data.area_mut(StorageArea::Local)
            .insert("k".to_string(), "local".to_string());
        data.area_mut(StorageArea::Session)
            .insert("k".to_string(), "session".to_string());

        assert_eq!(
            data.area(StorageArea::Local).get("k").map(String::as_str),
            Some("local")
        );
        let data = data.without_session_area();
        assert!(data.area(StorageArea::Session).is_empty());
        assert_eq!(data.area(StorageArea::Local).len(), 1);
    }
}
