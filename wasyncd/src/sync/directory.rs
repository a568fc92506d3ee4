use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wasync_core::{MessageFlags, WireMessage};

use super::store::{HeaderQuery, MailboxStore, StoreError};

const MESSAGE_EXTENSION: &str = "eml";
const FLAGS_FILENAME: &str = "flags.json";

/// Mailbox kept as a directory of `.eml` files.
///
/// Files are named after the message identifier, so appending the same
/// record twice overwrites one file. Seen and flagged state lives in a
/// `flags.json` sidecar keyed by identifier.
pub struct DirectoryMailbox {
    root: PathBuf,
    access_token: Option<String>,
    write_lock: Mutex<()>,
}

impl DirectoryMailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            access_token: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Requires `authenticate` to present exactly this token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn set_flags(&self, message_id: &str, flags: MessageFlags) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_flags().await?;
        all.insert(message_id.to_string(), flags);
        self.write_flags(&all).await
    }

    async fn read_flags(&self) -> Result<BTreeMap<String, MessageFlags>, StoreError> {
        match tokio::fs::read(self.root.join(FLAGS_FILENAME)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| StoreError::Permanent(format!("flags sidecar is corrupt: {err}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_flags(&self, flags: &BTreeMap<String, MessageFlags>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(flags)
            .map_err(|err| StoreError::Permanent(err.to_string()))?;
        write_atomic(&self.root.join(FLAGS_FILENAME), &bytes).await
    }

    async fn message_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == MESSAGE_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn load(&self, paths: &[PathBuf]) -> Result<Vec<WireMessage>, StoreError> {
        let flags = self.read_flags().await?;
        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = tokio::fs::read(path).await?;
            match WireMessage::parse(&raw) {
                Ok(mut message) => {
                    if let Some(stored) = message.message_id().and_then(|id| flags.get(id)) {
                        message.flags = *stored;
                    }
                    messages.push(message);
                }
                Err(err) => warn!(path = %path.display(), "skipping unreadable message: {err}"),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl MailboxStore for DirectoryMailbox {
    async fn authenticate(&self, access_token: &str) -> Result<(), StoreError> {
        if let Some(expected) = self.access_token.as_deref()
            && expected != access_token
        {
            return Err(StoreError::Auth("access token not accepted".into()));
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn append(&self, message: &WireMessage) -> Result<String, StoreError> {
        let id = message
            .message_id()
            .ok_or_else(|| StoreError::Permanent("message has no Message-ID".into()))?
            .to_string();
        let path = self
            .root
            .join(format!("{}.{MESSAGE_EXTENSION}", file_stem(&id)));

        let _guard = self.write_lock.lock().await;
        write_atomic(&path, message.to_rfc822().as_bytes()).await?;
        let mut flags = self.read_flags().await?;
        flags.insert(id.clone(), message.flags);
        self.write_flags(&flags).await?;
        debug!(message_id = %id, "message appended");
        Ok(id)
    }

    async fn search(&self, query: &HeaderQuery) -> Result<Vec<WireMessage>, StoreError> {
        let paths = self.message_paths().await?;
        let mut messages = self.load(&paths).await?;
        messages.retain(|message| query.matches(message));
        Ok(messages)
    }

    async fn fetch(&self, range: Range<usize>) -> Result<Vec<WireMessage>, StoreError> {
        let paths = self.message_paths().await?;
        let end = range.end.min(paths.len());
        let start = range.start.min(end);
        self.load(&paths[start..end]).await
    }
}

fn file_stem(message_id: &str) -> String {
    message_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
