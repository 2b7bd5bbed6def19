//! Credential persistence for the token authorizer.
//!
//! The authorizer owns the [`Credential`] and writes it through a
//! [`CredentialStore`] after every successful token response. Stores only
//! persist; they never decide whether a credential is still valid.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::TokenResponse;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Access/refresh token pair with its expiry.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: u64,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Credential {
    /// Build a credential from a token response received at `now`.
    ///
    /// A response without a refresh token keeps `previous_refresh`.
    pub(crate) fn from_response(
        response: TokenResponse,
        previous_refresh: Option<&str>,
        user_id: Option<String>,
        now: u64,
    ) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(Error::AuthExchange("token response has empty access_token".into()));
        }
        let refresh_token = match (response.refresh_token, previous_refresh) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(previous)) => previous.to_string(),
            _ => return Err(Error::AuthExchange("token response has no refresh_token".into())),
        };
        Ok(Self {
            access_token: response.access_token,
            refresh_token,
            expires_at: now.saturating_add(response.expires_in),
            user_id,
        })
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Key-value persistence for credentials and the current user id.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn user_id(&self) -> Result<Option<String>>;
    fn set_user_id(&self, user_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    credential: Option<Credential>,
    #[serde(default)]
    user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<StoredState>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with a credential.
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: Mutex::new(StoredState {
                user_id: credential.user_id.clone(),
                credential: Some(credential),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoredState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))?;
        Ok(f(&mut state))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        self.with_state(|s| s.credential.clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        self.with_state(|s| s.credential = Some(credential.clone()))
    }

    fn clear(&self) -> Result<()> {
        self.with_state(|s| s.credential = None)
    }

    fn user_id(&self) -> Result<Option<String>> {
        self.with_state(|s| s.user_id.clone())
    }

    fn set_user_id(&self, user_id: &str) -> Result<()> {
        self.with_state(|s| s.user_id = Some(user_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// JSON file store. Writes go to a temp file in the same directory and are
/// renamed into place; on unix the file is created owner-only.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<StoredState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Store(format!("parse {}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoredState::default()),
            Err(e) => Err(Error::Store(format!("read {}: {e}", self.path.display()))),
        }
    }

    fn write(&self, state: &StoredState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, json.as_bytes())
            .map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("rename to {}: {e}", self.path.display())))
    }

    fn update(&self, f: impl FnOnce(&mut StoredState)) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Store("file store lock poisoned".into()))?;
        let mut state = self.read()?;
        f(&mut state);
        self.write(&state)
    }
}

#[cfg(unix)]
fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.read()?.credential)
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        self.update(|s| s.credential = Some(credential.clone()))
    }

    fn clear(&self) -> Result<()> {
        self.update(|s| s.credential = None)
    }

    fn user_id(&self) -> Result<Option<String>> {
        Ok(self.read()?.user_id)
    }

    fn set_user_id(&self, user_id: &str) -> Result<()> {
        self.update(|s| s.user_id = Some(user_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: u64) -> Credential {
        Credential {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expires_at,
            user_id: Some("alice".into()),
        }
    }

    fn token_response(refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: "new-access".into(),
            refresh_token: refresh.map(String::from),
            expires_in: 60,
            token_type: Some("bearer".into()),
        }
    }

    #[test]
    fn from_response_computes_expiry() {
        let c = Credential::from_response(token_response(Some("r")), None, None, 1_000).unwrap();
        assert_eq!(c.expires_at, 1_060);
        assert_eq!(c.refresh_token, "r");
        assert!(!c.is_expired_at(1_059));
        assert!(c.is_expired_at(1_060));
    }

    #[test]
    fn from_response_keeps_previous_refresh_token() {
        let c = Credential::from_response(token_response(None), Some("old"), None, 0).unwrap();
        assert_eq!(c.refresh_token, "old");
    }

    #[test]
    fn from_response_without_any_refresh_token_fails() {
        let err = Credential::from_response(token_response(None), None, None, 0).unwrap_err();
        assert!(matches!(err, Error::AuthExchange(_)));
    }

    #[test]
    fn debug_redacts_tokens() {
        let text = format!("{:?}", credential(1));
        assert!(!text.contains("access\""));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&credential(10)).unwrap();
        assert_eq!(store.load().unwrap(), Some(credential(10)));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());

        store.set_user_id("bob").unwrap();
        assert_eq!(store.user_id().unwrap().as_deref(), Some("bob"));
    }

    #[test]
    fn memory_store_seeded_with_user() {
        let store = MemoryCredentialStore::with_credential(credential(10));
        assert_eq!(store.user_id().unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::new(&path);
        assert!(store.load().unwrap().is_none());
        store.set_user_id("alice").unwrap();
        store.save(&credential(99)).unwrap();

        let reopened = FileCredentialStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(credential(99)));
        assert_eq!(reopened.user_id().unwrap().as_deref(), Some("alice"));

        reopened.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.user_id().unwrap().as_deref(), Some("alice"));
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        FileCredentialStore::new(&path).save(&credential(1)).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileCredentialStore::new(&path).load(),
            Err(Error::Store(_))
        ));
    }
}
