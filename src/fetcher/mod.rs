//! Storage backends ("fetchers") that hold sprout definitions and compiled bundles.
//!
//! Paths are `/`-separated strings. Each backend decides what they are relative to.

pub mod filesystem;
pub mod memory;
pub mod meta;

pub use filesystem::FilesystemFetcher;
pub use memory::MemoryFetcher;
pub use meta::MetaFetcher;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// File name whose presence marks a directory as a sprout.
pub const SPROUT_MARKER_FILE: &str = "config.json";

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn file_exists(&self, path: &str) -> Result<bool>;

    async fn file_fetch(&self, path: &str) -> Result<String>;

    async fn file_last_updated(&self, path: &str) -> Result<DateTime<Utc>>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<()>;

    /// Whether `write_file` is supported. Read-only backends fail every write.
    fn writable(&self) -> bool;

    fn join_path(&self, base: &str, leaf: &str) -> String {
        join_path(base, leaf)
    }

    /// Every sprout directory this backend knows about, sorted.
    async fn list_sprouts(&self) -> Result<Vec<String>>;
}

pub fn join_path(base: &str, leaf: &str) -> String {
    let base = base.trim_end_matches('/');
    let leaf = leaf.trim_start_matches('/');
    if base.is_empty() {
        leaf.to_string()
    } else {
        format!("{base}/{leaf}")
    }
}

/// Parent directory of `path`, or `""` at the top level.
pub fn parent_path(path: &str) -> &str {
    path.rfind('/').map(|index| &path[..index]).unwrap_or("")
}
