//! Persisted identity state.
//!
//! One JSON file per upstream account, shaped like a browser-context export:
//! cookies plus per-origin storage, the account email when known, and the
//! deep link (`appUrl`) learned after a successful activation. Refreshed
//! cookies are written back after the agent comes up and periodically from
//! the health monitor.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use fleetgate_core_types::AuthIndex;

use crate::error::FleetError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default, rename = "httpOnly", skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OriginState {
    pub origin: String,
    #[serde(default, rename = "localStorage")]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentityState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
    #[serde(default, rename = "accountName", skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    /// Deep link to the account's initialized upstream app, when one has
    /// been created.
    #[serde(default, rename = "appUrl", skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct IdentityRecord {
    pub auth_index: AuthIndex,
    pub email: Option<String>,
    pub path: PathBuf,
}

pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, auth_index: AuthIndex) -> PathBuf {
        self.dir.join(format!("auth-{}.json", auth_index.0))
    }

    /// List every configured identity, ordered by index. Unparseable files
    /// are skipped with a warning rather than failing startup.
    pub fn enumerate(&self) -> Result<Vec<IdentityRecord>, FleetError> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(index) = parse_auth_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let auth_index = AuthIndex(index);
            let email = match self.load(auth_index) {
                Ok(state) => state.account_name,
                Err(err) => {
                    warn!(
                        target: "identity-store",
                        %auth_index,
                        %err,
                        "skipping unreadable identity file"
                    );
                    continue;
                }
            };
            records.push(IdentityRecord {
                auth_index,
                email,
                path: entry.path(),
            });
        }

        records.sort_by_key(|record| record.auth_index);
        Ok(records)
    }

    pub fn load(&self, auth_index: AuthIndex) -> Result<IdentityState, FleetError> {
        let path = self.path_for(auth_index);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FleetError::UnknownIdentity(auth_index))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, auth_index: AuthIndex, state: &IdentityState) -> Result<(), FleetError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(auth_index);
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&path, raw)?;
        Ok(())
    }

    /// Forget a dead deep link so the next activation starts from the blank
    /// app URL.
    pub fn clear_app_url(&self, auth_index: AuthIndex) -> Result<(), FleetError> {
        let mut state = self.load(auth_index)?;
        if state.app_url.take().is_some() {
            self.save(auth_index, &state)?;
        }
        Ok(())
    }
}

fn parse_auth_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("auth-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_state(email: &str, app_url: Option<&str>) -> IdentityState {
        IdentityState {
            cookies: vec![StoredCookie {
                name: "SID".into(),
                value: "abc".into(),
                domain: Some(".example.com".into()),
                ..Default::default()
            }],
            origins: vec![OriginState {
                origin: "https://example.com".into(),
                local_storage: vec![StorageEntry {
                    name: "theme".into(),
                    value: "dark".into(),
                }],
            }],
            account_name: Some(email.into()),
            app_url: app_url.map(Into::into),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let state = sample_state("a@example.com", Some("https://example.com/apps/x1"));
        store.save(AuthIndex(0), &state).unwrap();

        let loaded = store.load(AuthIndex(0)).unwrap();
        assert_eq!(loaded.account_name.as_deref(), Some("a@example.com"));
        assert_eq!(loaded.cookies.len(), 1);
        assert_eq!(
            loaded.app_url.as_deref(),
            Some("https://example.com/apps/x1")
        );
    }

    #[test]
    fn enumerate_orders_by_index_and_reads_email() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store.save(AuthIndex(2), &sample_state("c@x.com", None)).unwrap();
        store.save(AuthIndex(0), &sample_state("a@x.com", None)).unwrap();
        store.save(AuthIndex(1), &sample_state("b@x.com", None)).unwrap();

        let records = store.enumerate().unwrap();
        let indices: Vec<u32> = records.iter().map(|r| r.auth_index.0).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(records[1].email.as_deref(), Some("b@x.com"));
    }

    #[test]
    fn missing_identity_is_a_typed_error() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        assert!(matches!(
            store.load(AuthIndex(9)),
            Err(FleetError::UnknownIdentity(AuthIndex(9)))
        ));
    }

    #[test]
    fn clear_app_url_persists() {
        let dir = tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store
            .save(AuthIndex(0), &sample_state("a@x.com", Some("https://x/apps/1")))
            .unwrap();
        store.clear_app_url(AuthIndex(0)).unwrap();
        assert!(store.load(AuthIndex(0)).unwrap().app_url.is_none());
    }

    #[test]
    fn missing_directory_enumerates_empty() {
        let store = IdentityStore::new("/nonexistent/fleetgate-auth");
        assert!(store.enumerate().unwrap().is_empty());
    }
}
