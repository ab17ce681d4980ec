//! Directory-backed key-value backend.
//!
//! One file per key. Short keys are stored under the hex encoding of the
//! key so any cache key (slashes, braces, quotes) maps to a portable name.
//! Keys longer than [`MAX_PLAIN_KEY_BYTES`] would overflow the file-name
//! limit; they are stored under `h-{sha256}` with the key kept inside the
//! file next to the value.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use campus_core::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::traits::KvBackend;

const EXTENSION: &str = "json";
const HASHED_PREFIX: &str = "h-";

/// Longest key stored under its plain hex name (hex doubles it; file
/// names are capped at 255 bytes).
pub const MAX_PLAIN_KEY_BYTES: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
struct HashedEntry {
    key: String,
    value: String,
}

/// Persistent backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a backend rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_hashed(key: &str) -> bool {
        key.len() > MAX_PLAIN_KEY_BYTES
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let stem = if Self::is_hashed(key) {
            format!("{}{}", HASHED_PREFIX, hex::encode(Sha256::digest(key.as_bytes())))
        } else {
            hex::encode(key.as_bytes())
        };
        self.root.join(format!("{}.{}", stem, EXTENSION))
    }

    fn read_hashed(path: &Path) -> Result<Option<HashedEntry>, StoreError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        if Self::is_hashed(key) {
            // a digest collision reads as a miss
            let entry = Self::read_hashed(&path)?;
            return Ok(entry.filter(|e| e.key == key).map(|e| e.value));
        }
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let contents = if Self::is_hashed(key) {
            serde_json::to_string(&HashedEntry {
                key: key.to_string(),
                value: value.to_string(),
            })?
        } else {
            value.to_string()
        };
        // write-then-rename so readers never see a torn file
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // skip foreign or unreadable files rather than failing the listing
            if stem.starts_with(HASHED_PREFIX) {
                if let Ok(Some(entry)) = Self::read_hashed(&path) {
                    keys.push(entry.key);
                }
            } else if let Ok(bytes) = hex::decode(stem) {
                if let Ok(key) = String::from_utf8(bytes) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}
