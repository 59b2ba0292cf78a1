use super::Fetcher;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Routes each path to the backend mounted at its longest matching prefix.
pub struct MetaFetcher {
    default: Arc<dyn Fetcher>,
    mounts: Vec<(String, Arc<dyn Fetcher>)>,
}

impl MetaFetcher {
    pub fn new(default: Arc<dyn Fetcher>) -> Self {
        Self {
            default,
            mounts: Vec::new(),
        }
    }

    pub fn mount(mut self, prefix: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        self.mounts.push((prefix.into(), fetcher));
        self
    }

    fn fetcher_for_path(&self, path: &str) -> &Arc<dyn Fetcher> {
        self.mounts
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, fetcher)| fetcher)
            .unwrap_or(&self.default)
    }
}

#[async_trait]
impl Fetcher for MetaFetcher {
    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.fetcher_for_path(path).file_exists(path).await
    }

    async fn file_fetch(&self, path: &str) -> Result<String> {
        self.fetcher_for_path(path).file_fetch(path).await
    }

    async fn file_last_updated(&self, path: &str) -> Result<DateTime<Utc>> {
        self.fetcher_for_path(path).file_last_updated(path).await
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        self.fetcher_for_path(path).write_file(path, contents).await
    }

    fn writable(&self) -> bool {
        self.default.writable()
    }

    async fn list_sprouts(&self) -> Result<Vec<String>> {
        let mut sprouts: BTreeSet<String> =
            self.default.list_sprouts().await?.into_iter().collect();
        for (_, fetcher) in &self.mounts {
            sprouts.extend(fetcher.list_sprouts().await?);
        }
        Ok(sprouts.into_iter().collect())
    }
}
