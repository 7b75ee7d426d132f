//! Cached access tokens for the cloud storage backend.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(feature = "drive")]
mod oauth;
#[cfg(feature = "drive")]
pub use oauth::{Authenticator, ClientSecrets, DRIVE_FILE_SCOPE};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }
}

/// Where tokens live between runs.
pub trait CredentialStore {
    fn load(&self) -> Result<Option<Token>>;

    fn save(&self, token: &Token) -> Result<()>;

    fn is_valid(&self, token: &Token) -> bool {
        !token.access_token.is_empty() && !token.is_expired_at(Utc::now())
    }
}

/// Keeps the token as a JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Token>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&text) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                log::warn!("Ignoring unreadable token cache {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    fn save(&self, token: &Token) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(token)
            .map_err(|e| crate::Error::Credentials(e.to_string()))?;
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        log::debug!("Saved token to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in_secs: i64) -> Token {
        Token {
            access_token: "ya29.test".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn missing_cache_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("token.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn saved_token_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/token.json"));
        let token = token(3600);

        store.save(&token).unwrap();
        assert_eq!(store.load().unwrap(), Some(token));
    }

    #[test]
    fn corrupt_cache_forces_a_new_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "\u{80}pickle").unwrap();
        assert_eq!(FileCredentialStore::new(path).load().unwrap(), None);
    }

    #[test]
    fn validity_has_a_safety_margin() {
        let store = FileCredentialStore::new("unused.json");
        assert!(store.is_valid(&token(3600)));
        assert!(!store.is_valid(&token(30)));
        assert!(!store.is_valid(&token(-10)));
        assert!(!store.is_valid(&Token {
            access_token: String::new(),
            ..token(3600)
        }));
    }
}
