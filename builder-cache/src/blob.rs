//! The blob plane: content-addressed files under `blobs/<2-hex>/<digest>`.
//!
//! Writes are atomic (write to `tmp/`, then `fs::rename` into place); `materialize`
//! prefers a hardlink and falls back to a copy across filesystems, generalized from the
//! teacher's `ContentAddressableStore`.

use std::fs;
use std::path::{Path, PathBuf};

use builder_core::model::Digest;

use crate::error::{CacheError, Result};

/// On-disk, content-addressed blob store.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (creating if necessary) a blob store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("tmp"))?;
        Ok(BlobStore { root })
    }

    fn path_for(&self, digest: Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.shard_prefix())
            .join(digest.to_hex())
    }

    /// Whether a blob with this digest is present (existence only; no re-hash).
    pub fn contains(&self, digest: Digest) -> bool {
        self.path_for(digest).is_file()
    }

    /// Writes `bytes` under `digest`, atomically. A no-op if the blob already exists.
    pub fn put(&self, digest: Digest, bytes: &[u8]) -> Result<()> {
        let dest = self.path_for(digest);
        if dest.is_file() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self
            .root
            .join("tmp")
            .join(format!("{}.tmp", digest.to_hex()));
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &dest)?;
        Ok(())
    }

    /// Reads a blob's bytes.
    pub fn get(&self, digest: Digest) -> Result<Vec<u8>> {
        Ok(fs::read(self.path_for(digest))?)
    }

    /// Places a blob at `dest`, hardlinking when possible and copying otherwise
    /// (cross-filesystem, or the link syscall is unsupported on the target volume).
    /// `executable` sets the executable bit on the materialized file, matching the
    /// recorded output metadata.
    pub fn materialize(&self, digest: Digest, dest: &Path, executable: bool) -> Result<()> {
        let src = self.path_for(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        if fs::hard_link(&src, dest).is_err() {
            fs::copy(&src, dest)?;
        }
        #[cfg(unix)]
        if executable {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(dest)?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            fs::set_permissions(dest, perms)?;
        }
        #[cfg(not(unix))]
        let _ = executable;
        Ok(())
    }

    /// Removes a blob, used by the sweep reconciler for orphans.
    pub fn remove(&self, digest: Digest) -> Result<()> {
        let path = self.path_for(digest);
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Re-hashes a stored blob and compares it against `expected`.
    pub fn verify(&self, digest: Digest, hasher: &builder_hash::ContentHasher) -> Result<bool> {
        let path = self.path_for(digest);
        if !path.is_file() {
            return Ok(false);
        }
        let actual = hasher
            .hash_file(&path)
            .map_err(|e| CacheError::Corruption(e.to_string()))?;
        Ok(actual == digest)
    }

    /// Lists every blob digest currently on disk, for index reconciliation.
    pub fn all_digests(&self) -> Vec<Digest> {
        let blobs_dir = self.root.join("blobs");
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&blobs_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(digest) = Digest::from_hex(name) {
                        out.push(digest);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let digest = builder_hash::ContentHasher::default().hash_bytes(b"content");
        store.put(digest, b"content").unwrap();
        assert!(store.contains(digest));
        assert_eq!(store.get(digest).unwrap(), b"content");
    }

    #[test]
    fn materialize_hardlinks_within_same_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf()).unwrap();
        let digest = Digest(*blake3::hash(b"payload").as_bytes());
        store.put(digest, b"payload").unwrap();

        let dest = dir.path().join("out").join("artifact.bin");
        store.materialize(digest, &dest, false).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }
}
