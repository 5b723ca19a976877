//! Persistence of captured messages

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;

/// Reference to a message that has been written by a [`MessageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub path: PathBuf,
    pub size: usize,
}

/// Payload of the "message received" notification.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: StoredMessage,
    pub connection_id: u64,
    pub mail_from: String,
    pub recipients: Vec<String>,
    pub received_at: DateTime<Local>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably writes the body lines and returns where they went. Two calls
    /// never share a storage identity, however close together they run.
    async fn save(&self, lines: &[String]) -> Result<StoredMessage>;
}

/// Stores each message as a `.eml` file in a directory.
#[derive(Debug)]
pub struct FileMessageStore {
    dir: PathBuf,
    counter: AtomicU64,
}

impl FileMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create message directory: {:?}", dir))?;
        }
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_name(&self) -> String {
        let timestamp = Local::now().format("%Y%m%d%H%M%S%3f");
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}.eml", timestamp, seq)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save(&self, lines: &[String]) -> Result<StoredMessage> {
        let content = lines.join("\r\n");

        // create_new guards against another process writing into the same directory
        let (name, path, mut file) = loop {
            let name = self.next_name();
            let path = self.dir.join(&name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (name, path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {:?}", path));
                }
            }
        };

        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        file.sync_all().await?;

        Ok(StoredMessage {
            id: name,
            path,
            size: content.len(),
        })
    }
}
