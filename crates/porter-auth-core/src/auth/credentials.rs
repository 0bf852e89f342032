//! Cached, durable storage of the access token, refresh token and user profile.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::{debug, warn};

use crate::models::UserProfile;
use crate::storage::{DurableStorage, StorageResult};

/// Durable key for the access token
pub const ACCESS_TOKEN_KEY: &str = "auth_token";

/// Durable key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Durable key for the serialized user profile
pub const USER_KEY: &str = "auth_user";

static GLOBAL: OnceLock<CredentialStore> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    AccessToken,
    RefreshToken,
    User,
}

impl Slot {
    const ALL: [Slot; 3] = [Slot::AccessToken, Slot::RefreshToken, Slot::User];

    fn key(&self) -> &'static str {
        match self {
            Slot::AccessToken => ACCESS_TOKEN_KEY,
            Slot::RefreshToken => REFRESH_TOKEN_KEY,
            Slot::User => USER_KEY,
        }
    }
}

/// What the cache knows about one durable key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Cached {
    /// Not loaded yet, or invalidated; the next read goes to durable storage.
    #[default]
    Unknown,
    Absent,
    Present(String),
}

#[derive(Debug, Default)]
struct Cache {
    access_token: Cached,
    refresh_token: Cached,
    user: Cached,
    /// Bumped each time a session is stored or cleared.
    generation: u64,
}

impl Cache {
    fn slot(&mut self, slot: Slot) -> &mut Cached {
        match slot {
            Slot::AccessToken => &mut self.access_token,
            Slot::RefreshToken => &mut self.refresh_token,
            Slot::User => &mut self.user,
        }
    }

    fn forget(&mut self) {
        self.access_token = Cached::Unknown;
        self.refresh_token = Cached::Unknown;
        self.user = Cached::Unknown;
    }

    fn mark_all_absent(&mut self) {
        self.access_token = Cached::Absent;
        self.refresh_token = Cached::Absent;
        self.user = Cached::Absent;
    }
}

/// A user profile to persist, either structured or already serialized.
#[derive(Debug, Clone, Copy)]
pub enum ProfileRecord<'a> {
    Structured(&'a UserProfile),
    Serialized(&'a str),
}

impl<'a> From<&'a UserProfile> for ProfileRecord<'a> {
    fn from(profile: &'a UserProfile) -> Self {
        ProfileRecord::Structured(profile)
    }
}

impl<'a> From<&'a str> for ProfileRecord<'a> {
    fn from(serialized: &'a str) -> Self {
        ProfileRecord::Serialized(serialized)
    }
}

struct Inner {
    backend: Box<dyn DurableStorage>,
    cache: Mutex<Cache>,
}

/// The only way the rest of the crate touches persisted credentials.
///
/// Writes go to durable storage first and reach the cache only once they
/// succeeded. Reads come from the cache and fall through to durable storage
/// when the cache doesn't know the key. `clear()` always leaves the cache
/// in a known-empty state, so nothing stale is readable afterwards even if
/// the durable removal failed.
///
/// Clones share the same cache and backend.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    /// Wrap a backend without touching it; keys load lazily on first read.
    pub fn new(backend: impl DurableStorage + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Box::new(backend),
                cache: Mutex::new(Cache::default()),
            }),
        }
    }

    /// Wrap a backend and load all three keys into the cache.
    pub fn open(backend: impl DurableStorage + 'static) -> Self {
        let store = Self::new(backend);
        store.hydrate();
        store
    }

    /// Install the process-wide store. Returns the store back if one was
    /// already installed.
    pub fn install_global(store: CredentialStore) -> Result<(), CredentialStore> {
        GLOBAL.set(store)
    }

    /// The process-wide store, if one was installed.
    pub fn global() -> Option<CredentialStore> {
        GLOBAL.get().cloned()
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload every key from durable storage.
    pub fn hydrate(&self) {
        let mut cache = self.cache();
        for slot in Slot::ALL {
            *cache.slot(slot) = Cached::Unknown;
            self.read_through(&mut cache, slot);
        }
        debug!(
            has_token = matches!(cache.access_token, Cached::Present(_)),
            "Credential cache hydrated"
        );
    }

    /// Forget cached values so the next read goes to durable storage.
    pub fn invalidate_cache(&self) {
        self.cache().forget();
    }

    /// Identifies the current session. Changes whenever a session is
    /// persisted, cleared or expired, so work started under one session can
    /// tell whether it still applies.
    pub fn generation(&self) -> u64 {
        self.cache().generation
    }

    fn read_through(&self, cache: &mut Cache, slot: Slot) -> Option<String> {
        match cache.slot(slot) {
            Cached::Present(value) => return Some(value.clone()),
            Cached::Absent => return None,
            Cached::Unknown => {}
        }

        match self.inner.backend.get(slot.key()) {
            Ok(Some(value)) => {
                debug!(key = slot.key(), "Credential read through from durable storage");
                *cache.slot(slot) = Cached::Present(value.clone());
                Some(value)
            }
            Ok(None) => {
                *cache.slot(slot) = Cached::Absent;
                None
            }
            Err(e) => {
                // Leave the slot unknown so a later read retries
                warn!(key = slot.key(), error = %e, "Failed to read credential from durable storage");
                None
            }
        }
    }

    fn read(&self, slot: Slot) -> Option<String> {
        let mut cache = self.cache();
        self.read_through(&mut cache, slot)
    }

    fn write(&self, cache: &mut Cache, slot: Slot, value: Option<&str>) -> StorageResult<()> {
        match value {
            Some(value) => {
                self.inner.backend.set(slot.key(), value)?;
                *cache.slot(slot) = Cached::Present(value.to_string());
            }
            None => {
                self.inner.backend.remove(slot.key())?;
                *cache.slot(slot) = Cached::Absent;
            }
        }
        Ok(())
    }

    // ===== Access token =====

    /// The current access token. An empty stored token reads as absent.
    pub fn access_token(&self) -> Option<String> {
        self.read(Slot::AccessToken).filter(|t| !t.is_empty())
    }

    pub fn set_access_token(&self, token: &str) -> StorageResult<()> {
        let mut cache = self.cache();
        self.write(&mut cache, Slot::AccessToken, Some(token))
    }

    /// Store a new access token only if the session is still the one
    /// identified by `generation`. Returns false, writing nothing, when it
    /// has since been cleared or replaced.
    pub fn replace_access_token_if(&self, generation: u64, token: &str) -> StorageResult<bool> {
        let mut cache = self.cache();
        if cache.generation != generation {
            debug!("Session changed, dropping access token update");
            return Ok(false);
        }
        self.write(&mut cache, Slot::AccessToken, Some(token))?;
        Ok(true)
    }

    pub fn has_token(&self) -> bool {
        self.access_token().is_some()
    }

    // ===== Refresh token =====

    pub fn refresh_token(&self) -> Option<String> {
        self.read(Slot::RefreshToken).filter(|t| !t.is_empty())
    }

    /// Store the refresh token, or remove it with `None`.
    pub fn set_refresh_token(&self, token: Option<&str>) -> StorageResult<()> {
        let mut cache = self.cache();
        self.write(&mut cache, Slot::RefreshToken, token)
    }

    // ===== User profile =====

    /// The stored profile. Data that doesn't parse reads as no profile.
    pub fn user_profile(&self) -> Option<UserProfile> {
        let raw = self.read(Slot::User)?;
        match serde_json::from_str(&raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(error = %e, "Stored user profile is corrupt, ignoring it");
                None
            }
        }
    }

    pub fn set_user_profile<'a>(&self, profile: impl Into<ProfileRecord<'a>>) -> StorageResult<()> {
        let serialized = match profile.into() {
            ProfileRecord::Structured(profile) => serde_json::to_string(profile)?,
            ProfileRecord::Serialized(raw) => raw.to_string(),
        };
        let mut cache = self.cache();
        self.write(&mut cache, Slot::User, Some(&serialized))
    }

    // ===== Lifecycle =====

    /// Persist a complete session in one step. If any write fails, every
    /// key is cleared again so no partial credential is left behind.
    pub fn persist_session(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        profile: &UserProfile,
    ) -> StorageResult<()> {
        let serialized = serde_json::to_string(profile)?;
        let mut cache = self.cache();

        let result = self
            .write(&mut cache, Slot::AccessToken, Some(access_token))
            .and_then(|_| self.write(&mut cache, Slot::RefreshToken, refresh_token))
            .and_then(|_| self.write(&mut cache, Slot::User, Some(&serialized)));

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session, rolling back");
            self.clear_locked(&mut cache);
            return Err(e);
        }
        cache.generation += 1;
        Ok(())
    }

    fn clear_locked(&self, cache: &mut Cache) {
        for slot in Slot::ALL {
            if let Err(e) = self.inner.backend.remove(slot.key()) {
                warn!(key = slot.key(), error = %e, "Failed to remove credential from durable storage");
            }
        }
        cache.mark_all_absent();
        cache.generation += 1;
    }

    /// Remove the access token, refresh token and profile.
    pub fn clear(&self) {
        let mut cache = self.cache();
        self.clear_locked(&mut cache);
        debug!("Credentials cleared");
    }

    /// Clear the store if it currently holds an access token.
    ///
    /// Returns true when this call did the clearing. Concurrent callers
    /// reacting to the same expiry see exactly one `true`.
    pub fn expire(&self) -> bool {
        let mut cache = self.cache();
        self.expire_locked(&mut cache)
    }

    /// `expire`, but only while the session is still the one identified by
    /// `generation`.
    pub fn expire_if(&self, generation: u64) -> bool {
        let mut cache = self.cache();
        cache.generation == generation && self.expire_locked(&mut cache)
    }

    fn expire_locked(&self, cache: &mut Cache) -> bool {
        let has_token = self
            .read_through(cache, Slot::AccessToken)
            .is_some_and(|t| !t.is_empty());
        if !has_token {
            return false;
        }
        self.clear_locked(cache);
        debug!("Credentials expired");
        true
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print token values
        f.debug_struct("CredentialStore")
            .field("has_token", &self.has_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageError};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend sharing its map with the test so it can be edited "externally".
    #[derive(Clone, Default)]
    struct SharedStorage {
        inner: Arc<MemoryStorage>,
        fail_writes_to: Arc<Mutex<Option<&'static str>>>,
        fail_removes: Arc<AtomicBool>,
    }

    impl DurableStorage for SharedStorage {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            let failing = *self.fail_writes_to.lock().unwrap();
            if failing.is_some_and(|k| k == key) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("read-only")));
            }
            self.inner.remove(key)
        }
    }

    fn profile() -> UserProfile {
        UserProfile::new(1, "e@x.com")
    }

    #[test]
    fn test_set_then_get_access_token() {
        let store = CredentialStore::new(MemoryStorage::new());
        assert!(!store.has_token());

        store.set_access_token("t1").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("t1"));
        assert!(store.has_token());

        store.clear();
        assert_eq!(store.access_token(), None);
        assert!(!store.has_token());
    }

    #[test]
    fn test_empty_token_reads_as_absent() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.set_access_token("").unwrap();
        assert!(!store.has_token());
    }

    #[test]
    fn test_clones_share_cache() {
        let store = CredentialStore::new(MemoryStorage::new());
        let other = store.clone();
        store.set_access_token("t1").unwrap();
        assert_eq!(other.access_token().as_deref(), Some("t1"));
        other.clear();
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn test_open_hydrates_from_durable_storage() {
        let backend = SharedStorage::default();
        backend.inner.set(ACCESS_TOKEN_KEY, "t1").unwrap();
        backend.inner.set(USER_KEY, r#"{"id":1,"email":"e@x.com"}"#).unwrap();

        let store = CredentialStore::open(backend.clone());
        // Durable storage changes behind the cache's back are not seen...
        backend.inner.set(ACCESS_TOKEN_KEY, "t2").unwrap();
        assert_eq!(store.access_token().as_deref(), Some("t1"));
        assert_eq!(store.user_profile(), Some(profile()));

        // ...until the cache is invalidated
        store.invalidate_cache();
        assert_eq!(store.access_token().as_deref(), Some("t2"));
    }

    #[test]
    fn test_reads_fall_through_when_cache_is_empty() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        backend.inner.set(REFRESH_TOKEN_KEY, "r1").unwrap();
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[test]
    fn test_profile_accepts_structured_and_serialized() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.set_user_profile(&profile()).unwrap();
        assert_eq!(store.user_profile(), Some(profile()));

        store
            .set_user_profile(r#"{"id":2,"email":"f@x.com","name":"Fay"}"#)
            .unwrap();
        let restored = store.user_profile().unwrap();
        assert_eq!(restored.email, "f@x.com");
        assert_eq!(restored.name.as_deref(), Some("Fay"));
    }

    #[test]
    fn test_corrupt_profile_reads_as_none() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.set_user_profile("{not json").unwrap();
        assert_eq!(store.user_profile(), None);
    }

    #[test]
    fn test_refresh_token_can_be_removed() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.set_refresh_token(Some("r1")).unwrap();
        store.set_refresh_token(None).unwrap();
        assert_eq!(store.refresh_token(), None);
    }

    #[test]
    fn test_failed_write_leaves_cache_untouched() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        store.set_access_token("t1").unwrap();

        *backend.fail_writes_to.lock().unwrap() = Some(ACCESS_TOKEN_KEY);
        assert!(store.set_access_token("t2").is_err());
        assert_eq!(store.access_token().as_deref(), Some("t1"));
    }

    #[test]
    fn test_persist_session_rolls_back_on_failure() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        *backend.fail_writes_to.lock().unwrap() = Some(USER_KEY);

        assert!(store.persist_session("t1", Some("r1"), &profile()).is_err());
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
        assert!(backend.inner.is_empty());
    }

    #[test]
    fn test_clear_hides_values_even_if_removal_fails() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        store.persist_session("t1", Some("r1"), &profile()).unwrap();

        backend.fail_removes.store(true, Ordering::SeqCst);
        store.clear();
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
        assert_eq!(store.user_profile(), None);
    }

    #[test]
    fn test_expire_clears_once() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.persist_session("t1", None, &profile()).unwrap();

        assert!(store.expire());
        assert!(!store.expire());
        assert_eq!(store.user_profile(), None);
    }

    #[test]
    fn test_generation_moves_with_session_lifecycle() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        let initial = store.generation();

        store.persist_session("t1", Some("r1"), &profile()).unwrap();
        let signed_in = store.generation();
        assert_ne!(signed_in, initial);

        // Token refreshes and cache invalidation stay within the session
        store.set_access_token("t2").unwrap();
        store.invalidate_cache();
        assert_eq!(store.generation(), signed_in);

        store.clear();
        assert_ne!(store.generation(), signed_in);
    }

    #[test]
    fn test_replace_access_token_after_clear_writes_nothing() {
        let backend = SharedStorage::default();
        let store = CredentialStore::new(backend.clone());
        store.persist_session("t1", Some("r1"), &profile()).unwrap();
        let generation = store.generation();

        assert!(store.replace_access_token_if(generation, "t2").unwrap());
        assert_eq!(store.access_token().as_deref(), Some("t2"));

        store.clear();
        assert!(!store.replace_access_token_if(generation, "t3").unwrap());
        assert_eq!(store.access_token(), None);
        assert!(backend.inner.is_empty());
    }

    #[test]
    fn test_expire_if_ignores_a_newer_session() {
        let store = CredentialStore::new(MemoryStorage::new());
        store.persist_session("t1", None, &profile()).unwrap();
        let old = store.generation();
        store.persist_session("t2", None, &profile()).unwrap();

        assert!(!store.expire_if(old));
        assert_eq!(store.access_token().as_deref(), Some("t2"));
        assert!(store.expire_if(store.generation()));
        assert!(!store.has_token());
    }
}
