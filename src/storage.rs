//! Directory-scoped storage backend.
//!
//! Owns the open write handles for every live block, in a single directory. All operations are
//! async; this is where the engine's suspension points during `append`, `flush`, and `readBlock`
//! iteration live (see the concurrency model). The engine itself brackets its index/registry
//! mutations so that none of them straddle an `.await` here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_stream::stream;
use futures::Stream;
use snafu::ResultExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{BlockSnafu, PathSnafu, StorageError};

pub struct Storage {
    dir: PathBuf,
    handles: Mutex<HashMap<String, File>>,
}

impl Storage {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, bid: &str) -> PathBuf {
        self.dir.join(bid)
    }

    /// Ensures the directory backing this storage exists.
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|_| PathSnafu {
                path: self.dir.clone(),
            })
    }

    /// Lists every file in the directory ending with `extension`, with its on-disk size.
    pub async fn list_blocks(&self, extension: &str) -> Result<Vec<(String, u64)>, StorageError> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|_| PathSnafu {
                path: self.dir.clone(),
            })?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.with_context(|_| PathSnafu {
            path: self.dir.clone(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(extension) {
                continue;
            }
            let meta = entry.metadata().await.with_context(|_| PathSnafu {
                path: entry.path(),
            })?;
            found.push((name, meta.len()));
        }
        found.sort();
        Ok(found)
    }

    async fn open_for_append(&self, bid: &str) -> Result<File, StorageError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(bid))
            .await
            .with_context(|_| BlockSnafu {
                bid: bid.to_string(),
            })
    }

    /// Creates (or truncates-opens) a block file, registering a write handle for it.
    pub async fn create_block(&self, bid: &str) -> Result<(), StorageError> {
        let file = self.open_for_append(bid).await?;
        self.handles.lock().await.insert(bid.to_string(), file);
        Ok(())
    }

    /// Appends `line + '\n'` to the named block, opening a handle on first use. If `sync_now`
    /// is set, issues a file-data sync on the same call path before returning.
    pub async fn append_to_block(
        &self,
        bid: &str,
        line: &str,
        sync_now: bool,
    ) -> Result<(), StorageError> {
        let mut handles = self.handles.lock().await;
        if !handles.contains_key(bid) {
            let file = self.open_for_append(bid).await?;
            handles.insert(bid.to_string(), file);
        }
        let file = handles.get_mut(bid).expect("handle inserted above");
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        file.write_all(&buf).await.with_context(|_| BlockSnafu {
            bid: bid.to_string(),
        })?;
        if sync_now {
            file.sync_data().await.with_context(|_| BlockSnafu {
                bid: bid.to_string(),
            })?;
        }
        Ok(())
    }

    /// Flushes (fsyncs) a single block's write handle. A handle that is no longer open (because
    /// the block was deleted or renamed away out from under us) is treated as already-durable
    /// and the condition is swallowed rather than surfaced.
    pub async fn flush_block(&self, bid: &str) -> Result<(), StorageError> {
        let mut handles = self.handles.lock().await;
        if let Some(file) = handles.get_mut(bid) {
            match file.sync_data().await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(bid = %bid, "swallowed sync error on already-closed handle");
                    Ok(())
                }
                Err(e) => Err(StorageError::Block {
                    bid: bid.to_string(),
                    source: e,
                }),
            }
        } else {
            debug!(bid = %bid, "flush requested for block with no open handle");
            Ok(())
        }
    }

    /// Flushes every currently open write handle.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let bids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        for bid in bids {
            self.flush_block(&bid).await?;
        }
        Ok(())
    }

    /// Returns a lazy, ordered stream of `(line, line_no)` pairs for the named block. Lines are
    /// split on `'\n'`; a trailing fragment with no terminating newline is discarded.
    pub fn read_block(
        &self,
        bid: &str,
    ) -> impl Stream<Item = Result<(String, u64), StorageError>> + '_ {
        let bid = bid.to_string();
        let path = self.path_for(&bid);
        stream! {
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(StorageError::Block { bid: bid.clone(), source: e });
                    return;
                }
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let mut parts: Vec<&str> = text.split('\n').collect();
            // The segment after the last delimiter is either empty (file ends with '\n') or an
            // unterminated fragment (file does not); both are discarded per contract.
            parts.pop();
            for (idx, line) in parts.into_iter().enumerate() {
                yield Ok((line.to_string(), (idx + 1) as u64));
            }
        }
    }

    /// Closes the write handle for a block, if open, without deleting the file.
    pub async fn close_block(&self, bid: &str) -> Result<(), StorageError> {
        self.handles.lock().await.remove(bid);
        Ok(())
    }

    /// Deletes a block file outright. Implies closing its handle first.
    pub async fn delete_block(&self, bid: &str) -> Result<(), StorageError> {
        self.close_block(bid).await?;
        match fs::remove_file(self.path_for(bid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Block {
                bid: bid.to_string(),
                source: e,
            }),
        }
    }

    /// Renames a block file. Closes the source handle first so the filesystem rename is safe.
    pub async fn rename_block(&self, old: &str, new: &str) -> Result<(), StorageError> {
        self.close_block(old).await?;
        fs::rename(self.path_for(old), self.path_for(new))
            .await
            .with_context(|_| BlockSnafu {
                bid: old.to_string(),
            })
    }

    /// Returns the on-disk size of a single block.
    pub async fn stat(&self, bid: &str) -> Result<u64, StorageError> {
        let meta = fs::metadata(self.path_for(bid))
            .await
            .with_context(|_| BlockSnafu {
                bid: bid.to_string(),
            })?;
        Ok(meta.len())
    }

    /// Closes every open write handle.
    pub async fn close(&self) -> Result<(), StorageError> {
        self.flush_all().await?;
        self.handles.lock().await.clear();
        Ok(())
    }
}
