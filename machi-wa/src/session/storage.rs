//! Per-token credential directories.
//!
//! Each session owns `<root>/<encoded token>/`, created by the underlying
//! client and deleted wholesale when the session is removed. The encoding is
//! reversible, so no two tokens share a directory and restore recovers the
//! exact token.

use crate::util::{decode_token, encode_token};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem layout for session credentials.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Credential directory for `token`.
    #[must_use]
    pub fn dir_for(&self, token: &str) -> PathBuf {
        self.root.join(encode_token(token))
    }

    /// Whether credentials exist for `token`.
    pub async fn exists(&self, token: &str) -> bool {
        tokio::fs::try_exists(self.dir_for(token))
            .await
            .unwrap_or(false)
    }

    /// Delete the credential directory for `token`.
    ///
    /// A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the directory exists but cannot be removed.
    pub async fn delete(&self, token: &str) -> io::Result<()> {
        let dir = self.dir_for(token);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(token = %token, dir = %dir.display(), "credentials deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tokens of all credential directories, i.e. the sessions that can be
    /// resumed. Directories whose names do not decode are skipped. Returns an
    /// empty list when the root does not exist.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root exists but cannot be read.
    pub async fn list_tokens(&self) -> io::Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut tokens = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(decode_token) {
                Some(token) => tokens.push(token),
                None => debug!(dir = %entry.path().display(), "skipping unrecognised credential directory"),
            }
        }
        tokens.sort();
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    #[tokio::test]
    async fn test_dir_layout() {
        let store = CredentialStore::new("/var/lib/machi-wa/sessions");
        assert_eq!(
            store.dir_for("+15551234567"),
            PathBuf::from("/var/lib/machi-wa/sessions/+15551234567")
        );
        assert_eq!(
            store.dir_for("../etc"),
            PathBuf::from("/var/lib/machi-wa/sessions/_2E._2Fetc")
        );
        assert_ne!(store.dir_for("a/b"), store.dir_for("a_b"));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path().join("sessions"));
        assert!(store.list_tokens().await.unwrap().is_empty());

        for token in ["T2", "T1"] {
            let dir = store.dir_for(token);
            tokio::fs::create_dir_all(dir.join("Default")).await.unwrap();
            tokio::fs::write(dir.join("Default").join("creds.json"), "{}")
                .await
                .unwrap();
        }
        tokio::fs::write(store.root().join("stray.txt"), "x")
            .await
            .unwrap();
        tokio::fs::create_dir_all(store.root().join(".cache"))
            .await
            .unwrap();

        assert_eq!(store.list_tokens().await.unwrap(), vec!["T1", "T2"]);
        assert!(store.exists("T1").await);

        store.delete("T1").await.unwrap();
        assert!(!store.exists("T1").await);
        store.delete("T1").await.unwrap();
        assert_eq!(store.list_tokens().await.unwrap(), vec!["T2"]);
    }

    #[tokio::test]
    async fn test_list_recovers_exact_tokens() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path().join("sessions"));
        for token in ["+1 555", "a/b", "a_b"] {
            tokio::fs::create_dir_all(store.dir_for(token)).await.unwrap();
        }
        assert_eq!(
            store.list_tokens().await.unwrap(),
            vec!["+1 555", "a/b", "a_b"]
        );
    }
}
