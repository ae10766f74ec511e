//! Files registered for download by remote endpoints.

use crate::error::{WireError, WireResult};
use nodelink_types::UploadToken;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Maps upload tokens to local file paths. A path can be registered under
/// one token at a time.
pub struct UploadRegistry {
    next: AtomicU64,
    uploads: Mutex<HashMap<UploadToken, PathBuf>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Register `path` and return its token.
    pub fn register(&self, path: impl Into<PathBuf>) -> WireResult<UploadToken> {
        let path = path.into();
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        if uploads.values().any(|p| p == &path) {
            return Err(WireError::UploadAlreadyRegistered(path));
        }
        let token = UploadToken(self.next.fetch_add(1, Ordering::SeqCst));
        uploads.insert(token, path);
        Ok(token)
    }

    /// Remove a registration. Returns the path it pointed at.
    pub fn deregister(&self, token: UploadToken) -> Option<PathBuf> {
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads.remove(&token)
    }

    pub fn path_for(&self, token: UploadToken) -> Option<PathBuf> {
        let uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads.get(&token).cloned()
    }

    pub fn token_for(&self, path: &Path) -> Option<UploadToken> {
        let uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        uploads
            .iter()
            .find(|(_, registered)| registered.as_path() == path)
            .map(|(token, _)| *token)
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
