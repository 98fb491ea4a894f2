//! Content hashing for cache invalidation.
//!
//! All hashes are lowercase hex BLAKE3 digests.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use blake3::Hasher;
use serde::Serialize;
use tracing::{debug, trace};

use crate::Result;

/// Compute the hash of a single file's content.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute a combined hash over a set of files.
///
/// Each file contributes its path relative to `root` as well as its content,
/// so renaming a file changes the hash even when the bytes are identical.
/// Files are sorted by relative path first, so input order never matters.
/// Paths outside `root` contribute their path as given.
pub fn hash_files<P: AsRef<Path>>(root: &Path, files: &[P]) -> Result<String> {
    let mut entries: Vec<(String, PathBuf)> = files
        .iter()
        .map(|f| {
            let path = f.as_ref();
            let full = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            };
            (relative_key(root, &full), full)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.dedup_by(|a, b| a.0 == b.0);

    let mut hasher = Hasher::new();
    for (key, full) in &entries {
        trace!(file = %key, "hashing input file");
        hasher.update(key.as_bytes());
        hasher.update(&[0]);
        hasher.update(hash_file(full)?.as_bytes());
        hasher.update(b"\n");
    }

    let hash = hasher.finalize().to_hex().to_string();
    debug!(files = entries.len(), hash = %hash, "computed input hash");
    Ok(hash)
}

/// Hash any serializable configuration value.
///
/// The value is normalised through `serde_json::Value`, whose maps are
/// key-sorted, so field or key order never affects the result.
pub fn hash_config<T: Serialize + ?Sized>(config: &T) -> Result<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(config)?)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    // Normalise separators so the hash is stable across platforms.
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
