use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{seal, DurableStorage, StorageResult};

/// Session file name in the data directory
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Stores every key in a single JSON document on disk.
///
/// With a passphrase the document is sealed (Argon2 + ChaCha20-Poly1305)
/// before it is written. A document that can't be read back is treated as
/// empty so a damaged file degrades to "signed out".
pub struct FileStorage {
    path: PathBuf,
    passphrase: Option<String>,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSION_FILE),
            passphrase: None,
            lock: Mutex::new(()),
        }
    }

    pub fn with_passphrase(data_dir: impl AsRef<Path>, passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Some(passphrase.into()),
            ..Self::new(data_dir)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_sealed(&self) -> bool {
        self.passphrase.is_some()
    }

    /// When the document was last written, if it exists.
    pub fn updated_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.updated_at)
    }

    fn load(&self) -> StorageResult<SessionDocument> {
        if !self.path.exists() {
            return Ok(SessionDocument::default());
        }

        let bytes = std::fs::read(&self.path)?;
        let plaintext = if seal::is_sealed(&bytes) {
            let Some(ref passphrase) = self.passphrase else {
                warn!(path = ?self.path, "Session file is sealed but no passphrase is configured");
                return Ok(SessionDocument::default());
            };
            match seal::open(passphrase, &bytes) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Failed to open sealed session file");
                    return Ok(SessionDocument::default());
                }
            }
        } else {
            bytes
        };

        match serde_json::from_slice(&plaintext) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Session file is corrupt, ignoring it");
                Ok(SessionDocument::default())
            }
        }
    }

    fn save(&self, mut doc: SessionDocument) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        doc.updated_at = Some(Utc::now());
        let contents = serde_json::to_vec_pretty(&doc)?;
        let contents = match self.passphrase {
            Some(ref passphrase) => seal::seal(passphrase, &contents)?,
            None => contents,
        };

        // Write then rename so a crash never leaves a half-written document
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = ?self.path, keys = doc.values.len(), "Session file written");
        Ok(())
    }
}

impl DurableStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load()?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load()?;
        doc.values.insert(key.to_string(), value.to_string());
        self.save(doc)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.load()?;
        if doc.values.remove(key).is_none() {
            return Ok(());
        }
        if doc.values.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        self.save(doc)
    }
}
