use super::{Fetcher, SPROUT_MARKER_FILE};
use crate::error::{Result, SproutError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Backend over a directory on disk. Paths are relative to `root`.
pub struct FilesystemFetcher {
    root: PathBuf,
    writable: bool,
}

impl FilesystemFetcher {
    pub fn new(root: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            root: root.into(),
            writable,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn fetch_error(action: &str, path: &str, error: std::io::Error) -> SproutError {
    SproutError::Fetch(format!("Could not {action} {path}: {error}"))
}

fn find_sprouts(root: &Path) -> Vec<String> {
    let mut sprouts = Vec::new();
    for result in WalkBuilder::new(root).hidden(true).git_ignore(true).build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry below {}: {}", root.display(), e);
                continue;
            }
        };
        let is_file = entry.file_type().is_some_and(|t| t.is_file());
        if !is_file || entry.file_name() != SPROUT_MARKER_FILE {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let Ok(relative) = dir.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        sprouts.push(name);
    }
    sprouts.sort();
    sprouts.dedup();
    sprouts
}

#[async_trait]
impl Fetcher for FilesystemFetcher {
    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn file_fetch(&self, path: &str) -> Result<String> {
        tokio::fs::read_to_string(self.resolve(path))
            .await
            .map_err(|e| fetch_error("read", path, e))
    }

    async fn file_last_updated(&self, path: &str) -> Result<DateTime<Utc>> {
        let metadata = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| fetch_error("stat", path, e))?;
        let modified = metadata
            .modified()
            .map_err(|e| fetch_error("stat", path, e))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        if !self.writable {
            return Err(SproutError::Fetch(format!(
                "Cannot write {path}: {} is read-only",
                self.root.display()
            )));
        }
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fetch_error("create directory for", path, e))?;
        }
        debug!("Writing {}", target.display());
        tokio::fs::write(&target, contents)
            .await
            .map_err(|e| fetch_error("write", path, e))
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn list_sprouts(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || find_sprouts(&root))
            .await
            .map_err(|e| SproutError::Fetch(format!("Sprout listing failed: {e}")))
    }
}
