//! Client identities.
//!
//! The engine consults an [`IdentityStore`] to authenticate a hello, to mark
//! clients active while a session is up and to accumulate traffic.
//! [`ClientRegistry`] is the bundled store: a `DashMap` of [`ClientRecord`]s
//! persisted as a JSON object keyed by client id.

use crate::error::IdentityError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use yuki_crypto::constant_time::ct_eq_str;
use yuki_crypto::random::random_32;

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Identity collaborator consumed by the tunnel engine.
pub trait IdentityStore: Send + Sync {
    /// Whether `client_id` exists, is neither blocked nor expired, and
    /// presented `secret`.
    fn is_authorized(&self, client_id: &str, secret: &str) -> bool;

    /// Snapshot of a client record.
    fn get_client(&self, client_id: &str) -> Option<ClientRecord>;

    /// Mark a client as connected or disconnected.
    fn set_active(&self, client_id: &str, active: bool);

    /// Add to a client's cumulative traffic.
    fn update_traffic(&self, client_id: &str, bytes_up: u64, bytes_down: u64);

    /// Whether a client with a live session should lose it: the record is
    /// gone, blocked or expired.
    fn is_revoked(&self, client_id: &str) -> bool {
        self.get_client(client_id)
            .is_none_or(|record| record.blocked || record.is_expired_at(unix_time()))
    }
}

/// A registered client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Client identifier
    pub id: String,
    /// Shared secret presented in the hello
    pub secret: String,
    /// Display name
    pub name: String,
    /// Creation time, Unix seconds
    pub created_at: u64,
    /// Last authenticated activity, Unix seconds
    #[serde(default)]
    pub last_seen: Option<u64>,
    /// A session is currently up
    #[serde(default)]
    pub active: bool,
    /// Administratively blocked
    #[serde(default)]
    pub blocked: bool,
    /// Expiry time, Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Bandwidth allowance in bytes sent to the client (0 = unlimited)
    #[serde(default)]
    pub max_bandwidth: u64,
    /// Cumulative bytes sent to the client
    #[serde(default)]
    pub bytes_up: u64,
    /// Cumulative bytes received from the client
    #[serde(default)]
    pub bytes_down: u64,
}

impl ClientRecord {
    /// New record with the given credentials.
    pub fn new(id: impl Into<String>, secret: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            name: name.into(),
            created_at: unix_time(),
            last_seen: None,
            active: false,
            blocked: false,
            expires_at: None,
            max_bandwidth: 0,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Set the bandwidth allowance.
    #[must_use]
    pub fn with_max_bandwidth(mut self, bytes: u64) -> Self {
        self.max_bandwidth = bytes;
        self
    }

    /// Set the expiry time.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Take the administrative fields of `stored`, keeping this record's
    /// runtime fields.
    fn apply_policy(&mut self, stored: ClientRecord) {
        if stored.blocked != self.blocked {
            tracing::info!(
                client_id = %self.id,
                blocked = stored.blocked,
                "client block state changed"
            );
        }
        self.secret = stored.secret;
        self.name = stored.name;
        self.created_at = stored.created_at;
        self.blocked = stored.blocked;
        self.expires_at = stored.expires_at;
        self.max_bandwidth = stored.max_bandwidth;
    }

    /// Whether the record has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .field("last_seen", &self.last_seen)
            .field("active", &self.active)
            .field("blocked", &self.blocked)
            .field("expires_at", &self.expires_at)
            .field("max_bandwidth", &self.max_bandwidth)
            .field("bytes_up", &self.bytes_up)
            .field("bytes_down", &self.bytes_down)
            .finish()
    }
}

/// In-memory client registry with JSON persistence.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientRecord>,
}

impl ClientRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client with a random id and secret.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Random`] if the OS RNG fails.
    pub fn create(
        &self,
        name: impl Into<String>,
        max_bandwidth: u64,
        expires_at: Option<u64>,
    ) -> Result<ClientRecord, IdentityError> {
        let mut record = ClientRecord::new(generate_id(), hex::encode(random_32()?), name)
            .with_max_bandwidth(max_bandwidth);
        record.expires_at = expires_at;

        self.insert(record.clone())?;
        tracing::info!(client_id = %record.id, name = %record.name, "client registered");
        Ok(record)
    }

    /// Add an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Duplicate`] if the id is taken.
    pub fn insert(&self, record: ClientRecord) -> Result<(), IdentityError> {
        match self.clients.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(IdentityError::Duplicate(record.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove a client.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] for an unknown id.
    pub fn delete(&self, client_id: &str) -> Result<ClientRecord, IdentityError> {
        self.clients
            .remove(client_id)
            .map(|(_, record)| record)
            .ok_or_else(|| IdentityError::NotFound(client_id.to_string()))
    }

    /// Block a client.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] for an unknown id.
    pub fn block(&self, client_id: &str) -> Result<(), IdentityError> {
        self.set_blocked(client_id, true)
    }

    /// Unblock a client.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::NotFound`] for an unknown id.
    pub fn unblock(&self, client_id: &str) -> Result<(), IdentityError> {
        self.set_blocked(client_id, false)
    }

    fn set_blocked(&self, client_id: &str, blocked: bool) -> Result<(), IdentityError> {
        let mut record = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| IdentityError::NotFound(client_id.to_string()))?;
        record.blocked = blocked;
        tracing::info!(client_id, blocked, "client block state changed");
        Ok(())
    }

    /// All records, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ClientRecord> {
        let mut records: Vec<_> = self.clients.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Load a registry from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Io`] or [`IdentityError::Format`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let data = fs::read(path.as_ref())?;
        let records: BTreeMap<String, ClientRecord> = serde_json::from_slice(&data)?;
        let clients = records.into_iter().collect();
        Ok(Self { clients })
    }

    /// Load a registry, or start empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// As [`ClientRegistry::load`], except for a missing file.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        match Self::load(path) {
            Err(IdentityError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::new())
            }
            other => other,
        }
    }

    /// Save the registry as pretty-printed JSON, readable only by the owner
    /// on Unix.
    ///
    /// The file is replaced by rename, so a concurrent reader sees either the
    /// old or the new contents.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Io`] or [`IdentityError::Format`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let path = path.as_ref();
        let records: BTreeMap<String, ClientRecord> = self
            .clients
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let data = serde_json::to_vec_pretty(&records)?;

        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&staging)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    /// Reconcile with the file at `path` and write the result back.
    ///
    /// The file owns membership and policy (secret, name, block state,
    /// expiry, bandwidth allowance), so clients added, edited or deleted
    /// there since the last sync take effect here. This registry owns the
    /// runtime fields (active, traffic, last seen) of clients it already
    /// knows. A missing file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Io`] or [`IdentityError::Format`]; the
    /// registry is left untouched if the file cannot be parsed.
    pub fn sync(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let path = path.as_ref();
        let on_disk: BTreeMap<String, ClientRecord> = match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        self.clients.retain(|id, _| {
            let keep = on_disk.contains_key(id);
            if !keep {
                tracing::info!(client_id = %id, "client removed from registry file");
            }
            keep
        });

        for (id, stored) in on_disk {
            match self.clients.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                    slot.get_mut().apply_policy(stored);
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    tracing::info!(client_id = %slot.key(), "client added from registry file");
                    slot.insert(ClientRecord {
                        active: false,
                        ..stored
                    });
                }
            }
        }

        self.save(path)
    }
}

impl IdentityStore for ClientRegistry {
    fn is_authorized(&self, client_id: &str, secret: &str) -> bool {
        let Some(record) = self.clients.get(client_id) else {
            return false;
        };
        if record.blocked || record.is_expired_at(unix_time()) {
            return false;
        }
        ct_eq_str(&record.secret, secret)
    }

    fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
        self.clients.get(client_id).map(|r| r.value().clone())
    }

    fn set_active(&self, client_id: &str, active: bool) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.active = active;
            if active {
                record.last_seen = Some(unix_time());
            }
        }
    }

    fn update_traffic(&self, client_id: &str, bytes_up: u64, bytes_down: u64) {
        if let Some(mut record) = self.clients.get_mut(client_id) {
            record.bytes_up = record.bytes_up.saturating_add(bytes_up);
            record.bytes_down = record.bytes_down.saturating_add(bytes_down);
            record.last_seen = Some(unix_time());
        }
    }
}

/// Random version-4 UUID in its hyphenated text form.
fn generate_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}
