//! JSON-document store on disk, used by the CLI so a sign-in survives between
//! invocations. The `Session` area is discarded when the store is opened,
//! mirroring a browser tab being closed. The file holds refresh tokens, so it
//! is created with owner-only permissions. An unreadable document is deleted
//! and replaced by an empty one: a store that cannot be cleared would keep
//! its tokens through a sign-out.

use super::{Cookie, SessionStore, StorageArea, StoreData};
use crate::error::Result;
use chrono::Utc;
use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, warn};

pub const STORE_FILE_NAME: &str = "storage.json";

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Opens (or creates) the store inside `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory or the document cannot be written.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let store = Self {
            path: dir.join(STORE_FILE_NAME),
            lock: Mutex::new(()),
        };

        let data = store.load()?.without_session_area();
        store.save(&data)?;

        debug!("session store opened at {}", store.path.display());

        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // The guard protects no data, only the read-modify-write sequence.
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<StoreData> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(StoreData::default()),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                warn!("{} is not UTF-8, discarding it", self.path.display());
                self.discard()?;
                return Ok(StoreData::default());
            }
            Err(err) => return Err(err.into()),
        };
        if contents.trim().is_empty() {
            return Ok(StoreData::default());
        }

        match serde_json::from_str(&contents) {
            Ok(data) => Ok(data),
            Err(err) => {
                warn!("{} is unreadable ({err}), discarding it", self.path.display());
                self.discard()?;
                Ok(StoreData::default())
            }
        }
    }

    fn discard(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn save(&self, data: &StoreData) -> Result<()> {
        let contents = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        // A leftover temp file would keep its old permissions.
        match fs::remove_file(&tmp) {
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }

        let mut file = owner_only().open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&StoreData) -> T) -> Result<T> {
        let _guard = self.guard();
        let data = self.load()?;
        Ok(f(&data))
    }

    fn write(&self, f: impl FnOnce(&mut StoreData)) -> Result<()> {
        let _guard = self.guard();
        let mut data = self.load()?;
        f(&mut data);
        self.save(&data)
    }
}

#[cfg(unix)]
fn owner_only() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    options
}

impl SessionStore for FileStore {
    fn get(&self, area: StorageArea, key: &str) -> Result<Option<String>> {
        self.read(|data| data.area(area).get(key).cloned())
    }

    fn set(&self, area: StorageArea, key: &str, value: &str) -> Result<()> {
        self.write(|data| {
            data.area_mut(area)
                .insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, area: StorageArea, key: &str) -> Result<()> {
        self.write(|data| {
            data.area_mut(area).remove(key);
        })
    }

    fn keys(&self, area: StorageArea) -> Result<Vec<String>> {
        self.read(|data| data.area(area).keys().cloned().collect())
    }

    fn clear(&self, area: StorageArea) -> Result<()> {
        self.write(|data| data.area_mut(area).clear())
    }

    fn cookies(&self) -> Result<Vec<Cookie>> {
        self.read(|data| data.live_cookies(Utc::now()))
    }

    fn set_cookie(&self, cookie: Cookie) -> Result<()> {
        self.write(|data| data.put_cookie(cookie, Utc::now()))
    }
}
