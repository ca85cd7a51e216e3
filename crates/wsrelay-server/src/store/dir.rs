//! Directory-backed [`KvStore`].
//!
//! Layout: `<root>/<table>/<escaped key>`, one file per record. Bytes
//! outside `[A-Za-z0-9_-]` are written as `%XX` (uppercase hex), so plain
//! ASCII keys cost one byte per character. The escape is applied byte by
//! byte and no plain byte is `%`, so it preserves key prefixes: a prefix
//! scan is a directory listing filtered on the escaped prefix. Keys whose
//! escaped form exceeds [`MAX_FILE_NAME`] are rejected. Keys differing only
//! in letter case collide on case-insensitive filesystems. Writes land in a
//! dot-prefixed temp file and are renamed into place, so readers never see
//! a torn record. Survives process crashes and can be shared by several
//! processes on one host.

use super::{KvStore, StoreError, StoreResult, Table};
use async_trait::async_trait;
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Longest escaped file name accepted (most filesystems cap at 255).
const MAX_FILE_NAME: usize = 240;

#[derive(Debug, Clone)]
pub struct DirKv {
    root: PathBuf,
}

impl DirKv {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for table in Table::ALL {
            std::fs::create_dir_all(root.join(table.name()))?;
        }
        info!(path = %root.display(), "directory store ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, table: Table, key: &str) -> StoreResult<PathBuf> {
        let name = escape_key(key);
        if name.len() > MAX_FILE_NAME {
            return Err(StoreError::Backend(format!(
                "key too long for directory store ({} bytes escaped): {key}",
                name.len()
            )));
        }
        Ok(self.root.join(table.name()).join(name))
    }
}

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// File name for `key`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        if is_plain(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

/// Key for a file name written by [`escape_key`]; `None` for anything else.
fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let code = bytes.get(i + 1..i + 3)?;
                if code.iter().any(|c| c.is_ascii_lowercase()) {
                    return None;
                }
                let decoded = hex::decode(code).ok()?;
                if is_plain(decoded[0]) {
                    return None;
                }
                out.push(decoded[0]);
                i += 3;
            }
            b if is_plain(b) => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}

fn temp_name() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    format!(".tmp-{}", hex::encode(bytes))
}

#[async_trait]
impl KvStore for DirKv {
    async fn get(&self, table: Table, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.record_path(table, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                table,
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, table: Table, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let path = self.record_path(table, key)?;
        let tmp = self.root.join(table.name()).join(temp_name());
        tokio::fs::write(&tmp, &value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(table = %table, key = %key, "record written");
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> StoreResult<()> {
        let path = self.record_path(table, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let escaped_prefix = escape_key(prefix);
        let mut dir = tokio::fs::read_dir(self.root.join(table.name())).await?;
        let mut out = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') || !name.starts_with(&escaped_prefix) {
                continue;
            }
            let key = match unescape_key(name) {
                Some(key) => key,
                None => {
                    debug!(table = %table, file = %name, "skipping foreign file");
                    continue;
                }
            };
            match tokio::fs::read(entry.path()).await {
                Ok(data) => out.push((key, data)),
                // Deleted between listing and read.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "dir"
    }
}
