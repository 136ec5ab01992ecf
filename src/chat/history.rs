//! Append-only per-group history file.
//!
//! Layout: a big-endian `u64` record count, then one entry per record made
//! of a `u32` length and the encoded record.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::protocol::MessageRecord;
use crate::utils::ChatError;

use bytes::{Buf, Bytes, BytesMut};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Durable history of one group.
#[derive(Debug)]
pub struct HistoryFile {
    path: PathBuf,
    file: File,

    /// Number of records currently in the file.
    count: u64,
}

impl HistoryFile {
    /// Opens the history file at `path`, creating it with a zero count if it
    /// does not exist yet.
    pub async fn open(path: &Path) -> Result<Self, ChatError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await?;

        let count = if file.metadata().await?.len() < 8 {
            file.set_len(0).await?;
            file.write_u64(0).await?;
            file.flush().await?;
            0
        } else {
            file.seek(SeekFrom::Start(0)).await?;
            file.read_u64().await?
        };

        Ok(HistoryFile {
            path: path.to_path_buf(),
            file,
            count,
        })
    }

    /// Number of records persisted so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Appends one record, then updates the count header.
    pub async fn append(&mut self, record: &MessageRecord) -> Result<(), ChatError> {
        let mut entry = BytesMut::new();
        record.encode(&mut entry);

        self.file.seek(SeekFrom::End(0)).await?;
        self.file.write_u32(entry.len() as u32).await?;
        self.file.write_all(&entry).await?;

        self.count += 1;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_u64(self.count).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Returns up to `n` most recent records, oldest first.
    pub async fn recover(&self, n: usize) -> Result<Vec<MessageRecord>, ChatError> {
        if n == 0 {
            return Ok(vec![]);
        }
        let mut data = Bytes::from(fs::read(&self.path).await?);
        if data.remaining() < 8 {
            return Ok(vec![]);
        }
        let count = data.get_u64();

        let mut recent = VecDeque::with_capacity(n);
        for _ in 0..count {
            if data.remaining() < 4 {
                break;
            }
            let len = data.get_u32() as usize;
            if data.remaining() < len {
                break;
            }
            let mut entry = data.split_to(len);
            let record = MessageRecord::decode(&mut entry)?;
            if recent.len() == n {
                recent.pop_front();
            }
            recent.push_back(record);
        }
        Ok(recent.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RecordKind;

    async fn fresh_path(name: &str) -> Result<PathBuf, ChatError> {
        let dir = PathBuf::from("/tmp/replichat-test-history");
        fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        let _ = fs::remove_file(&path).await;
        Ok(path)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn append_and_recover() -> Result<(), ChatError> {
        let path = fresh_path("append.hist").await?;
        let mut history = HistoryFile::open(&path).await?;
        for i in 0..5 {
            let text = format!("message {}", i);
            history
                .append(&MessageRecord::new("frank", RecordKind::User, text))
                .await?;
        }
        assert_eq!(history.count(), 5);

        let last = history.recover(3).await?;
        let texts: Vec<_> = last.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["message 2", "message 3", "message 4"]);
        assert_eq!(history.recover(10).await?.len(), 5);
        assert!(history.recover(0).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reopen_keeps_count() -> Result<(), ChatError> {
        let path = fresh_path("reopen.hist").await?;
        {
            let mut history = HistoryFile::open(&path).await?;
            history
                .append(&MessageRecord::server("server", "first"))
                .await?;
            history
                .append(&MessageRecord::server("server", "second"))
                .await?;
        }
        let mut history = HistoryFile::open(&path).await?;
        assert_eq!(history.count(), 2);
        history
            .append(&MessageRecord::server("server", "third"))
            .await?;
        let all = history.recover(10).await?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].text, "third");
        assert_eq!(all[0].kind, RecordKind::Server);
        Ok(())
    }
}
