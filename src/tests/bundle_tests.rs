use crate::fetcher::{Fetcher, FilesystemFetcher, MemoryFetcher};
use crate::llm::{AiProvider, CompletionChunk};
use crate::sprout::{Sprout, SproutOptions};
use crate::tests::mocks::{reply, test_env, MockCompletionProvider};
use crate::types::CompiledSprout;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

fn at(month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap()
}

fn bundle(last_updated: &str, version: u32) -> String {
    json!({
        "version": version,
        "lastUpdated": last_updated,
        "name": "counter",
        "config": {"version": 0, "title": "Compiled Counter"},
        "baseInstructions": "Compiled instructions",
        "schemaText": "type State = { count: number }",
        "starterState": {"count": 42}
    })
    .to_string()
}

fn definition(writable: bool) -> MemoryFetcher {
    MemoryFetcher::new(writable)
        .with_file("counter/config.json", r#"{"title": "Counter"}"#, at(1))
        .with_file("counter/instructions.md", "Count things.", at(1))
        .with_file("counter/schema.ts", "type State = { count: number }", at(1))
}

fn sprout_on(
    fetcher: Arc<dyn Fetcher>,
    replies: Vec<Vec<CompletionChunk>>,
) -> (Sprout, Arc<MockCompletionProvider>) {
    let backend = Arc::new(MockCompletionProvider::new(replies));
    let ai = AiProvider::new(
        "openai.com:gpt-4-1106-preview".parse().unwrap(),
        test_env(),
        backend.clone(),
    );
    let sprout = Sprout::new(
        "counter",
        fetcher,
        SproutOptions {
            ai: Some(Arc::new(ai)),
            debug: false,
        },
    );
    (sprout, backend)
}

#[tokio::test]
async fn test_fresh_bundle_short_circuits_sources() {
    let fetcher = definition(true).with_file(
        "counter/compiled.json",
        bundle("2024-02-01T00:00:00Z", 0),
        at(2),
    );
    let (mut sprout, backend) = sprout_on(Arc::new(fetcher), vec![]);

    assert!(sprout.compiled().await.unwrap());
    assert_eq!(sprout.config().await.unwrap().title, "Compiled Counter");
    assert_eq!(
        sprout.base_instructions().await.unwrap(),
        "Compiled instructions"
    );
    assert_eq!(sprout.last_state().await.unwrap(), json!({"count": 42}));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_newer_source_invalidates_bundle() {
    let fetcher = definition(true)
        .with_file(
            "counter/compiled.json",
            bundle("2024-02-01T00:00:00Z", 0),
            at(2),
        )
        .with_file("counter/instructions.md", "Count things, again.", at(3));
    let (mut sprout, backend) = sprout_on(Arc::new(fetcher), vec![reply(r#"{"count": 0}"#, 4)]);

    assert!(!sprout.compiled().await.unwrap());
    assert_eq!(sprout.config().await.unwrap().title, "Counter");
    assert_eq!(
        sprout.base_instructions().await.unwrap(),
        "Count things, again."
    );
    assert_eq!(sprout.starter_state().await.unwrap(), json!({"count": 0}));
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn test_read_only_storage_trusts_stale_bundle() {
    let fetcher = definition(false)
        .with_file(
            "counter/compiled.json",
            bundle("2024-02-01T00:00:00Z", 0),
            at(2),
        )
        .with_file("counter/schema.ts", "type State = { total: number }", at(6));
    let (mut sprout, backend) = sprout_on(Arc::new(fetcher), vec![]);

    assert!(sprout.compiled().await.unwrap());
    assert_eq!(sprout.starter_state().await.unwrap(), json!({"count": 42}));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_bundle_version_is_ignored() {
    let fetcher = definition(false).with_file(
        "counter/compiled.json",
        bundle("2024-02-01T00:00:00Z", 1),
        at(2),
    );
    let (mut sprout, _) = sprout_on(Arc::new(fetcher), vec![]);
    assert!(!sprout.compiled().await.unwrap());
    assert_eq!(sprout.config().await.unwrap().title, "Counter");
}

#[tokio::test]
async fn test_compile_writes_and_adopts_bundle() {
    let fetcher = Arc::new(definition(true));
    let (mut sprout, backend) = sprout_on(fetcher.clone(), vec![reply(r#"{"count": 0}"#, 4)]);

    sprout.compile().await.unwrap();
    assert!(sprout.compiled().await.unwrap());
    assert_eq!(backend.call_count(), 1);

    let written: CompiledSprout =
        serde_json::from_str(&fetcher.file_fetch("counter/compiled.json").await.unwrap()).unwrap();
    assert_eq!(written.version, 0);
    assert_eq!(written.name, "counter");
    assert_eq!(written.config.title, "Counter");
    assert_eq!(written.base_instructions, "Count things.");
    assert_eq!(written.starter_state, json!({"count": 0}));

    // A second instance picks the bundle up without calling the model.
    let (mut again, backend) = sprout_on(fetcher.clone(), vec![]);
    assert!(again.compiled().await.unwrap());
    again.compile().await.unwrap();
    assert_eq!(again.last_state().await.unwrap(), json!({"count": 0}));
    assert_eq!(backend.call_count(), 0);

    // Editing a source file afterwards makes the bundle stale again.
    fetcher
        .touch("counter/schema.ts", "type State = { n: number }", Utc::now() + chrono::Duration::hours(1))
        .await;
    let (mut stale, _) = sprout_on(fetcher, vec![]);
    assert!(!stale.compiled().await.unwrap());
}

#[tokio::test]
async fn test_compile_is_noop_on_read_only_storage() {
    let fetcher = Arc::new(definition(false));
    let (mut sprout, backend) = sprout_on(fetcher.clone(), vec![reply(r#"{"count": 0}"#, 4)]);

    sprout.compile().await.unwrap();
    assert!(!fetcher.file_exists("counter/compiled.json").await.unwrap());
    assert!(!sprout.compiled().await.unwrap());
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_compile_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("counter");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("config.json"), r#"{"title": "Counter"}"#).unwrap();
    std::fs::write(root.join("instructions.md"), "Count things.").unwrap();
    std::fs::write(root.join("schema.ts"), "type State = { count: number }").unwrap();

    let fetcher: Arc<dyn Fetcher> = Arc::new(FilesystemFetcher::new(dir.path(), true));
    assert_eq!(fetcher.list_sprouts().await.unwrap(), vec!["counter"]);

    let (mut sprout, _) = sprout_on(fetcher, vec![reply(r#"{"count": 0}"#, 4)]);
    sprout.compile().await.unwrap();

    let raw = std::fs::read_to_string(root.join("compiled.json")).unwrap();
    assert!(raw.contains("\n\t\"version\": 0"));
    let value: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["starterState"], json!({"count": 0}));
    assert!(value["lastUpdated"].as_str().is_some());
}
