use super::{parent_path, Fetcher, SPROUT_MARKER_FILE};
use crate::error::{Result, SproutError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MemoryFile {
    contents: String,
    last_updated: DateTime<Utc>,
}

/// In-memory backend with explicit modification times.
pub struct MemoryFetcher {
    files: RwLock<HashMap<String, MemoryFile>>,
    writable: bool,
}

impl MemoryFetcher {
    pub fn new(writable: bool) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            writable,
        }
    }

    /// Adds a file stamped with `last_updated`. Works on read-only instances too.
    pub fn with_file(
        mut self,
        path: impl Into<String>,
        contents: impl Into<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        self.files.get_mut().insert(
            path.into(),
            MemoryFile {
                contents: contents.into(),
                last_updated,
            },
        );
        self
    }

    /// Replaces a file regardless of the writable flag and sets its timestamp.
    pub async fn touch(&self, path: &str, contents: &str, last_updated: DateTime<Utc>) {
        self.files.write().await.insert(
            path.to_string(),
            MemoryFile {
                contents: contents.to_string(),
                last_updated,
            },
        );
    }

    async fn get(&self, path: &str) -> Result<MemoryFile> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| SproutError::Fetch(format!("No such file: {path}")))
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.read().await.contains_key(path))
    }

    async fn file_fetch(&self, path: &str) -> Result<String> {
        Ok(self.get(path).await?.contents)
    }

    async fn file_last_updated(&self, path: &str) -> Result<DateTime<Utc>> {
        Ok(self.get(path).await?.last_updated)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        if !self.writable {
            return Err(SproutError::Fetch(format!(
                "Cannot write {path}: storage is read-only"
            )));
        }
        self.touch(path, contents, Utc::now()).await;
        Ok(())
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn list_sprouts(&self) -> Result<Vec<String>> {
        let files = self.files.read().await;
        let sprouts: BTreeSet<String> = files
            .keys()
            .filter(|path| {
                path.rsplit('/').next() == Some(SPROUT_MARKER_FILE)
            })
            .map(|path| parent_path(path).to_string())
            .collect();
        Ok(sprouts.into_iter().collect())
    }
}
