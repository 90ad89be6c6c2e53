use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    File,
}

impl TokenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenSource::Environment => "DESKCHAT_TOKEN",
            TokenSource::File => "secrets file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SecretsFile {
    token: Option<String>,
    base_url: Option<String>,
    updated_at: Option<i64>,
}

pub struct AuthStore {
    path: PathBuf,
    base_url: String,
}

impl AuthStore {
    pub fn new(path: PathBuf, base_url: String) -> Self {
        Self { path, base_url }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.load_token_with_source()?.map(|(token, _)| token))
    }

    pub fn load_token_with_source(&self) -> Result<Option<(String, TokenSource)>, AuthError> {
        if let Ok(token) = env::var("DESKCHAT_TOKEN") {
            if !token.trim().is_empty() {
                return Ok(Some((token.trim().to_string(), TokenSource::Environment)));
            }
        }

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::Io(err)),
        };

        let secrets: SecretsFile = serde_json::from_str(&contents)?;
        if let Some(base_url) = secrets.base_url.as_deref() {
            if base_url != self.base_url {
                return Ok(None);
            }
        }
        Ok(secrets
            .token
            .filter(|token| !token.trim().is_empty())
            .map(|token| (token, TokenSource::File)))
    }

    pub fn store_token(&self, token: &str) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }

        let secrets = SecretsFile {
            token: Some(token.to_string()),
            base_url: Some(self.base_url.clone()),
            updated_at: Some(chrono::Utc::now().timestamp()),
        };
        let payload = serde_json::to_string_pretty(&secrets)?;
        fs::write(&self.path, payload)?;
        set_file_permissions(&self.path, 0o600)?;
        Ok(())
    }

    pub fn clear_token(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::Io(err)),
        }
    }
}

fn ensure_dir(path: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(path)?;
    set_dir_permissions(path, 0o700)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path, mode: u32) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perm)
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path, _mode: u32) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir()
            .join(format!("deskchat-auth-{}-{name}", std::process::id()))
            .join("secrets.json")
    }

    // DESKCHAT_TOKEN shadows the file, so skip when it is set.
    #[test]
    fn store_load_and_clear_round_trip() {
        if env::var("DESKCHAT_TOKEN").is_ok() {
            return;
        }
        let path = temp_path("round-trip");
        let store = AuthStore::new(path.clone(), "http://localhost:23373".to_string());

        store.store_token("abc").expect("store");
        let loaded = store.load_token_with_source().expect("load");
        assert_eq!(loaded, Some(("abc".to_string(), TokenSource::File)));

        store.clear_token().expect("clear");
        store.clear_token().expect("clear twice");
        assert_eq!(store.load_token().expect("load"), None);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn token_for_another_server_is_ignored() {
        if env::var("DESKCHAT_TOKEN").is_ok() {
            return;
        }
        let path = temp_path("other-server");
        AuthStore::new(path.clone(), "http://one.example".to_string())
            .store_token("abc")
            .expect("store");

        let store = AuthStore::new(path.clone(), "http://two.example".to_string());
        assert_eq!(store.load_token().expect("load"), None);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }
}
