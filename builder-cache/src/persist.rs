//! On-disk persistence for the entry index: one append-only log per shard under
//! `index/shard-<NN>.log` (§6 "the action cache index persists as a length-prefixed record
//! stream per shard, fronted by a 4-byte magic and a schema version").
//!
//! Each record is `[u32 LE key_len][key hex bytes][u32 LE entry_len][entry JSON bytes]`.
//! Replay applies records in file order, so a later record for the same key overwrites an
//! earlier one — this makes the log trivially append-on-write with no read-modify-write of
//! existing records, at the cost of requiring compaction over time (`compact_shard` below).

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use builder_core::model::{ActionKey, CacheEntry, Digest};

use crate::error::{CacheError, Result};

const MAGIC: [u8; 4] = *b"BLCX";
const SCHEMA_VERSION: u32 = 1;
const SHARD_COUNT: usize = 64;

fn shard_path(index_dir: &Path, shard: usize) -> PathBuf {
    index_dir.join(format!("shard-{shard:02}.log"))
}

fn write_header(file: &mut File) -> Result<()> {
    file.write_all(&MAGIC)?;
    file.write_all(&SCHEMA_VERSION.to_le_bytes())?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<u32> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(CacheError::Corruption("bad index shard magic".to_string()));
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    Ok(u32::from_le_bytes(version))
}

/// Appends one `(key, entry)` record to its shard's log, creating the log (with header) if
/// this is the first write.
pub fn append_record(index_dir: &Path, key: ActionKey, entry: &CacheEntry) -> Result<()> {
    fs::create_dir_all(index_dir)?;
    let shard = (key.0 .0[0] as usize) % SHARD_COUNT;
    let path = shard_path(index_dir, shard);
    let is_new = !path.is_file();

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    if is_new {
        write_header(&mut file)?;
    }

    let key_bytes = key.0.to_hex().into_bytes();
    let entry_bytes = serde_json::to_vec(entry)?;

    file.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
    file.write_all(&key_bytes)?;
    file.write_all(&(entry_bytes.len() as u32).to_le_bytes())?;
    file.write_all(&entry_bytes)?;
    Ok(())
}

/// Replays every shard log under `index_dir`, returning the full set of `(key, entry)`
/// pairs with later records winning over earlier ones for the same key. Missing or empty
/// logs are simply skipped; a shard whose header doesn't match is logged and skipped rather
/// than failing the whole load, matching the cache's "never fatal on corruption" stance.
pub fn load_all(index_dir: &Path) -> Result<Vec<(ActionKey, CacheEntry)>> {
    let mut out = Vec::new();
    if !index_dir.is_dir() {
        return Ok(out);
    }
    for shard in 0..SHARD_COUNT {
        let path = shard_path(index_dir, shard);
        if !path.is_file() {
            continue;
        }
        match load_shard(&path) {
            Ok(records) => out.extend(records),
            Err(err) => {
                tracing::warn!(shard, %err, "skipping unreadable index shard");
            }
        }
    }
    Ok(out)
}

fn load_shard(path: &Path) -> Result<Vec<(ActionKey, CacheEntry)>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let _version = read_header(&mut reader)?;

    let mut out = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let key_len = u32::from_le_bytes(len_buf) as usize;
        let mut key_buf = vec![0u8; key_len];
        reader.read_exact(&mut key_buf)?;
        let key_hex = String::from_utf8(key_buf)
            .map_err(|e| CacheError::Corruption(e.to_string()))?;
        let digest = Digest::from_hex(&key_hex)
            .ok_or_else(|| CacheError::Corruption(format!("bad key hex: {key_hex}")))?;

        reader.read_exact(&mut len_buf)?;
        let entry_len = u32::from_le_bytes(len_buf) as usize;
        let mut entry_buf = vec![0u8; entry_len];
        reader.read_exact(&mut entry_buf)?;
        let entry: CacheEntry = serde_json::from_slice(&entry_buf)?;

        out.push((ActionKey(digest), entry));
    }
    Ok(out)
}

/// Rewrites a shard log from a fresh snapshot of its live entries, dropping superseded and
/// tombstoned records. Called periodically by `sweep`, never on the hot insert path.
pub fn compact_shard(
    index_dir: &Path,
    shard: usize,
    live: &[(ActionKey, CacheEntry)],
) -> Result<()> {
    fs::create_dir_all(index_dir)?;
    let path = shard_path(index_dir, shard);
    let tmp_path = index_dir.join(format!("shard-{shard:02}.log.tmp"));

    let mut file = File::create(&tmp_path)?;
    write_header(&mut file)?;
    for (key, entry) in live {
        let key_bytes = key.0.to_hex().into_bytes();
        let entry_bytes = serde_json::to_vec(entry)?;
        file.write_all(&(key_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&key_bytes)?;
        file.write_all(&(entry_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&entry_bytes)?;
    }
    drop(file);
    fs::rename(&tmp_path, &path)?;
    Ok(())
}
