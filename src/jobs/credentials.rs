use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use super::JobId;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: Option<String>) -> Self {
        Self {
            email: email.into(),
            password: password.filter(|p| !p.is_empty()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// In-process credential store keyed by job. Nothing here touches the database.
#[derive(Default)]
pub struct CredentialVault {
    inner: Mutex<HashMap<JobId, Credentials>>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, job_id: JobId, credentials: Credentials) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job_id, credentials);
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<Credentials> {
        self.inner.lock().ok()?.get(&job_id).cloned()
    }

    /// Replace the password of an existing entry. Returns false if none exists.
    pub fn set_password(&self, job_id: JobId, password: String) -> bool {
        match self.inner.lock() {
            Ok(mut map) => match map.get_mut(&job_id) {
                Some(creds) => {
                    creds.password = Some(password);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}
