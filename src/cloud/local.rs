use chrono::{DateTime, Local, NaiveDateTime};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{CloudError, CloudPhotoStore, CloudSession, RemoteAsset};
use crate::config::{CloudAccount, CloudConfig};
use crate::scanner::discovery::discover_files;

const INVALID_CREDENTIALS: &str = "Invalid email/password combination";

/// Photo library exported to disk, one directory per account under `library_root`.
pub struct LocalLibraryStore {
    root: PathBuf,
    accounts: Vec<CloudAccount>,
    verified: Arc<Mutex<HashSet<String>>>,
}

impl LocalLibraryStore {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            root: config.library_root.clone(),
            accounts: config.accounts.clone(),
            verified: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl CloudPhotoStore for LocalLibraryStore {
    fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Arc<dyn CloudSession>, CloudError> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| CloudError::AuthenticationFailed(INVALID_CREDENTIALS.to_string()))?;

        if account.password != password {
            return Err(CloudError::AuthenticationFailed(INVALID_CREDENTIALS.to_string()));
        }

        let library = self.root.join(&account.email);
        if !library.is_dir() {
            return Err(CloudError::Other(format!(
                "library directory {} does not exist",
                library.display()
            )));
        }

        tracing::debug!(email = %account.email, library = ?library, "opened local library session");

        Ok(Arc::new(LocalSession {
            email: account.email.clone(),
            library,
            expected_code: account.second_factor_code.clone(),
            verified: Arc::clone(&self.verified),
        }))
    }
}

struct LocalSession {
    email: String,
    library: PathBuf,
    expected_code: Option<String>,
    verified: Arc<Mutex<HashSet<String>>>,
}

impl LocalSession {
    fn ensure_verified(&self) -> Result<(), CloudError> {
        if self.requires_second_factor() {
            Err(CloudError::SecondFactorRequired)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, CloudError> {
        let relative = Path::new(id);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(CloudError::Other(format!("invalid asset id {id}")));
        }
        Ok(self.library.join(relative))
    }
}

impl CloudSession for LocalSession {
    fn requires_second_factor(&self) -> bool {
        match self.expected_code {
            Some(_) => self
                .verified
                .lock()
                .map(|v| !v.contains(&self.email))
                .unwrap_or(true),
            None => false,
        }
    }

    fn validate_second_factor(&self, code: &str) -> Result<bool, CloudError> {
        let Some(expected) = &self.expected_code else {
            return Ok(true);
        };

        if expected.trim() != code.trim() {
            return Ok(false);
        }

        self.verified
            .lock()
            .map_err(|e| CloudError::Other(format!("session state poisoned: {e}")))?
            .insert(self.email.clone());
        Ok(true)
    }

    fn list_assets(&self, limit: usize) -> Result<Vec<RemoteAsset>, CloudError> {
        self.ensure_verified()?;

        let files = discover_files(&self.library).map_err(|e| CloudError::Other(e.to_string()))?;

        let mut assets = Vec::new();
        for path in files.into_iter().take(limit) {
            let Ok(relative) = path.strip_prefix(&self.library) else {
                continue;
            };
            let filename = match relative.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            let dir = relative
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .filter(|p| !p.is_empty());

            assets.push(RemoteAsset {
                id: relative.to_string_lossy().to_string(),
                filename,
                path: dir,
                created_at: modified_time(&path),
            });
        }

        Ok(assets)
    }

    fn download(&self, asset: &RemoteAsset) -> Result<Vec<u8>, CloudError> {
        self.ensure_verified()?;
        let path = self.resolve(&asset.id)?;
        std::fs::read(&path).map_err(|e| CloudError::Other(format!("{}: {e}", path.display())))
    }
}

fn modified_time(path: &Path) -> NaiveDateTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| DateTime::<Local>::from(t).naive_local())
        .unwrap_or_else(|_| Local::now().naive_local())
}
