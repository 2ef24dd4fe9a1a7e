//! htpasswd credential store.
//!
//! # Responsibilities
//! - Load `user:hash` entries once at startup
//! - Verify basic-auth credentials against `{SHA}` hashes
//!
//! # Design Decisions
//! - An unreadable file is fatal; unsupported hash schemes are skipped
//! - Hash comparison does not short-circuit on the first differing byte

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

const SHA_PREFIX: &str = "{SHA}";

#[derive(Debug, thiserror::Error)]
pub enum HtpasswdError {
    #[error("failed to read htpasswd file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// Username to base64 SHA-1 digest.
#[derive(Debug, Clone, Default)]
pub struct Htpasswd {
    entries: HashMap<String, String>,
}

impl Htpasswd {
    pub fn load(path: &Path) -> Result<Self, HtpasswdError> {
        let content = std::fs::read_to_string(path).map_err(|source| HtpasswdError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::parse(&content);
        tracing::info!(path = %path.display(), users = store.len(), "htpasswd file loaded");
        Ok(store)
    }

    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, hash)) = line.split_once(':') else {
                tracing::warn!(line = lineno + 1, "Skipping malformed htpasswd line");
                continue;
            };
            match hash.strip_prefix(SHA_PREFIX) {
                Some(digest) => {
                    entries.insert(user.to_string(), digest.to_string());
                }
                None => {
                    tracing::warn!(user, line = lineno + 1, "Skipping htpasswd entry with unsupported hash scheme");
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        let Some(expected) = self.entries.get(user) else {
            return false;
        };
        let actual = STANDARD.encode(Sha1::digest(password.as_bytes()));
        constant_time_eq(expected.as_bytes(), actual.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
