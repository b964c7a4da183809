use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{Config, APP_NAME};
use crate::models::TokenPair;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "_usertoken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "_refreshtoken";

const COOKIE_FILE: &str = "cookies.json";
const KV_FILE: &str = "local_storage.json";

/// Change notifications buffered per subscriber before older ones are dropped.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// One place a token can be kept.
pub trait TokenBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Backends
// ============================================================================

/// In-process store. Used for tests and when embedding without a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TokenBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// A persisted cookie-style entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub path: String,
    pub same_site: SameSite,
    pub secure: bool,
}

impl CookieEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Reads and writes a JSON map file, serializing access within the process.
#[derive(Debug)]
struct JsonFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn update<V, R>(&self, f: impl FnOnce(&mut HashMap<String, V>) -> R) -> Result<R>
    where
        V: Serialize + for<'de> Deserialize<'de>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_unlocked()?;
        let result = f(&mut map);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&map)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(result)
    }

    fn read<V>(&self) -> Result<HashMap<String, V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    fn read_unlocked<V>(&self) -> Result<HashMap<String, V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}

/// Cookie-like store: entries carry expiry, path and same-site attributes.
/// Expired entries read as absent.
#[derive(Debug)]
pub struct CookieStore {
    file: JsonFile,
    ttl: Duration,
}

impl CookieStore {
    pub fn new(dir: &Path, ttl: Duration) -> Self {
        Self {
            file: JsonFile::new(dir.join(COOKIE_FILE)),
            ttl,
        }
    }

    /// Full entry including attributes, if present and not expired
    pub fn entry(&self, key: &str) -> Result<Option<CookieEntry>> {
        let map: HashMap<String, CookieEntry> = self.file.read()?;
        Ok(map.get(key).filter(|e| !e.is_expired()).cloned())
    }
}

impl TokenBackend for CookieStore {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entry(key)?.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry = CookieEntry {
            value: value.to_string(),
            expires_at: Utc::now() + self.ttl,
            path: "/".to_string(),
            same_site: SameSite::Strict,
            secure: true,
        };
        self.file.update(|map: &mut HashMap<String, CookieEntry>| {
            map.insert(key.to_string(), entry);
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.file.update(|map: &mut HashMap<String, CookieEntry>| {
            map.remove(key);
        })
    }
}

/// Plain key-value store, the local-storage fallback.
#[derive(Debug)]
pub struct KeyValueStore {
    file: JsonFile,
}

impl KeyValueStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            file: JsonFile::new(dir.join(KV_FILE)),
        }
    }
}

impl TokenBackend for KeyValueStore {
    fn name(&self) -> &'static str {
        "local-storage"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let map: HashMap<String, String> = self.file.read()?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.file.update(|map: &mut HashMap<String, String>| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.file.update(|map: &mut HashMap<String, String>| {
            map.remove(key);
        })
    }
}

/// OS keychain store.
#[derive(Debug)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl TokenBackend for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let entry = Entry::new(&self.service, key).context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve token from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry = Entry::new(&self.service, key).context("Failed to create keyring entry")?;
        entry
            .set_password(value)
            .context("Failed to store token in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        let entry = Entry::new(&self.service, key).context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}

// ============================================================================
// Credential store
// ============================================================================

/// Published whenever a key is written or cleared through any handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// Origin id of the handle that made the change
    pub origin: u64,
}

/// Tokens as currently persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Redundant token storage over an ordered list of backends.
///
/// Writes go to every backend; reads return the first backend that has
/// the key. Cloning keeps the origin id; [`CredentialStore::handle`] makes
/// a sibling with its own origin, the way a second browser tab would see
/// the same storage.
#[derive(Clone)]
pub struct CredentialStore {
    backends: Arc<Vec<Arc<dyn TokenBackend>>>,
    changes: broadcast::Sender<StorageChange>,
    origin: u64,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("CredentialStore")
            .field("backends", &names)
            .field("origin", &self.origin)
            .finish()
    }
}

impl CredentialStore {
    pub fn new(backends: Vec<Arc<dyn TokenBackend>>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backends: Arc::new(backends),
            changes,
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Two independent in-memory backends, mirroring the cookie + local
    /// storage pair without touching disk.
    pub fn in_memory() -> Self {
        Self::new(vec![Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new())])
    }

    /// Cookie store first, then local storage, then (optionally) the keychain.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config.data_dir()?;
        let mut backends: Vec<Arc<dyn TokenBackend>> = vec![
            Arc::new(CookieStore::new(&dir, config.token_ttl())),
            Arc::new(KeyValueStore::new(&dir)),
        ];
        if config.use_keyring {
            backends.push(Arc::new(KeyringStore::new(APP_NAME)));
        }
        debug!(dir = %dir.display(), keyring = config.use_keyring, "Credential store configured");
        Ok(Self::new(backends))
    }

    /// A sibling handle over the same storage with a distinct origin.
    pub fn handle(&self) -> Self {
        Self {
            backends: Arc::clone(&self.backends),
            changes: self.changes.clone(),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Write to every backend. Fails only if none accepted the value.
    pub fn save(&self, name: &str, value: &str) -> Result<()> {
        let mut last_err = None;
        let mut written = 0;
        for backend in self.backends.iter() {
            match backend.set(name, value) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(backend = backend.name(), key = name, error = %e, "Failed to save token");
                    last_err = Some(e);
                }
            }
        }
        if written == 0 {
            if let Some(e) = last_err {
                return Err(e.context(format!("No credential backend accepted {}", name)));
            }
        }
        self.notify(name);
        Ok(())
    }

    /// First value found, in backend order.
    ///
    /// A failing backend is skipped as long as a later one answers. If
    /// nothing was found and any backend failed, the absence can't be
    /// trusted and the last error is returned instead of `None`.
    pub fn try_read(&self, name: &str) -> Result<Option<String>> {
        let mut last_err = None;
        for backend in self.backends.iter() {
            match backend.get(name) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => {
                    warn!(backend = backend.name(), key = name, error = %e, "Failed to read token");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e.context(format!("Could not read {} from storage", name))),
            None => Ok(None),
        }
    }

    /// Like [`try_read`](Self::try_read), with read failures counted as a miss.
    pub fn read(&self, name: &str) -> Option<String> {
        self.try_read(name).ok().flatten()
    }

    /// Remove from every backend, continuing past failures.
    pub fn clear(&self, name: &str) -> Result<()> {
        let mut failures = Vec::new();
        for backend in self.backends.iter() {
            if let Err(e) = backend.remove(name) {
                warn!(backend = backend.name(), key = name, error = %e, "Failed to clear token");
                failures.push(backend.name());
            }
        }
        self.notify(name);
        if !failures.is_empty() && failures.len() == self.backends.len() {
            anyhow::bail!("Failed to clear {} from every backend", name);
        }
        Ok(())
    }

    pub fn save_tokens(&self, tokens: &TokenPair) -> Result<()> {
        self.save(ACCESS_TOKEN_KEY, &tokens.access_token)?;
        self.save(REFRESH_TOKEN_KEY, &tokens.refresh_token)?;
        Ok(())
    }

    /// Both tokens, or an error if storage couldn't say whether they exist
    pub fn read_tokens(&self) -> Result<StoredTokens> {
        Ok(StoredTokens {
            access_token: self.try_read(ACCESS_TOKEN_KEY)?,
            refresh_token: self.try_read(REFRESH_TOKEN_KEY)?,
        })
    }

    /// Clear both token keys; attempts both even if the first fails.
    pub fn clear_tokens(&self) -> Result<()> {
        let access = self.clear(ACCESS_TOKEN_KEY);
        let refresh = self.clear(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }

    fn notify(&self, key: &str) {
        // No subscribers is fine
        let _ = self.changes.send(StorageChange {
            key: key.to_string(),
            origin: self.origin,
        });
    }
}

/// Whether a change touches one of the token keys
pub fn is_token_key(key: &str) -> bool {
    key == ACCESS_TOKEN_KEY || key == REFRESH_TOKEN_KEY
}
