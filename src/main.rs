mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sprout::fetcher::{Fetcher, FilesystemFetcher};
use sprout::llm::{
    AiProvider, CompletionModelId, CompletionProvider, Environment, ModelProvider,
    OpenAIProvider, PlaybackProvider, RecordingProvider,
};
use sprout::{Prompt, Sprout, SproutOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

/// Model used when none is given: the engine needs forced-JSON replies.
const DEFAULT_JSON_MODEL: &str = "openai.com:gpt-4-1106-preview";
/// Model used by default for sprouts that accept images.
const DEFAULT_IMAGE_MODEL: &str = "openai.com:gpt-4-vision-preview";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory that sprout paths are relative to
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Model to use, as provider:modelName
    #[arg(short = 'm', long, global = true)]
    model: Option<String>,

    /// API base URL for the model provider
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Stream raw model tokens instead of the revealed message
    #[arg(long, global = true)]
    debug: bool,

    /// Never write compiled bundles
    #[arg(long, global = true)]
    read_only: bool,

    /// Record model responses to a file
    #[arg(long, global = true)]
    record: Option<PathBuf>,

    /// Play back recorded model responses from a file
    #[arg(long, global = true)]
    playback: Option<PathBuf>,

    /// Fast playback mode - ignore chunk timing when playing recordings
    #[arg(long, global = true)]
    fast_playback: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Talk to a sprout in the terminal
    Chat {
        /// Sprout directory, relative to --root
        path: String,

        /// Image URL to attach to the first message
        #[arg(long)]
        image: Option<String>,
    },

    /// Write compiled.json for every sprout below --root that needs one
    Compile,

    /// Check that a sprout's definition files load
    Validate {
        /// Sprout directory, relative to --root
        path: String,
    },

    /// List the sprouts below --root
    List,
}

fn environment_from_process() -> Environment {
    let mut env = Environment::new();
    let key_name = ModelProvider::OpenAI.info().api_key_var;
    if let Ok(value) = std::env::var(key_name.to_uppercase()) {
        env.insert(key_name.to_string(), value);
    }
    env
}

async fn create_ai_provider(args: &Args, default_model: &str) -> Result<Arc<AiProvider>> {
    let model: CompletionModelId = args
        .model
        .as_deref()
        .unwrap_or(default_model)
        .parse()
        .context("Invalid --model")?;
    let mut env = environment_from_process();

    let backend: Arc<dyn CompletionProvider> = if let Some(path) = &args.playback {
        // Recorded sessions need no credentials.
        env.entry(model.provider.info().api_key_var.to_string())
            .or_insert_with(|| "playback".to_string());
        Arc::new(
            PlaybackProvider::from_file(path, !args.fast_playback)
                .await
                .with_context(|| format!("Failed to load recording {}", path.display()))?,
        )
    } else {
        let openai: Arc<dyn CompletionProvider> = match &args.base_url {
            Some(base_url) => Arc::new(OpenAIProvider::with_base_url(base_url.clone())),
            None => Arc::new(OpenAIProvider::new()),
        };
        match &args.record {
            Some(path) => Arc::new(RecordingProvider::new(openai, path.clone())),
            None => openai,
        }
    };

    debug!("Using model {}", model);
    Ok(Arc::new(AiProvider::new(model, env, backend)))
}

fn create_fetcher(args: &Args) -> Arc<dyn Fetcher> {
    Arc::new(FilesystemFetcher::new(args.root.clone(), !args.read_only))
}

async fn read_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<Option<String>> {
    print!("> ");
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?)
}

async fn run_chat(args: &Args, path: &str, image: Option<&str>) -> Result<()> {
    let fetcher = create_fetcher(args);

    // The model depends on the sprout, so peek at its config first.
    let mut probe = Sprout::new(path, fetcher.clone(), SproutOptions::default());
    probe
        .validate()
        .await
        .with_context(|| format!("Invalid sprout {}", path))?;
    let default_model = if probe.allow_images().await? {
        DEFAULT_IMAGE_MODEL
    } else {
        DEFAULT_JSON_MODEL
    };

    let ai = create_ai_provider(args, default_model).await?;
    let mut sprout = Sprout::new(
        path,
        fetcher,
        SproutOptions {
            ai: Some(ai),
            debug: args.debug,
        },
    );

    let config = sprout.config().await?;
    println!("{}", config.title);
    if let Some(description) = &config.description {
        println!("{}", description);
    }
    println!();

    let mut print_stream = |text: &str| {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    };

    chat_turn(&mut sprout, &mut print_stream).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_image = image.map(str::to_string);
    while let Some(line) = read_line(&mut lines).await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let message = match pending_image.take() {
            Some(image) => Prompt::from(line).with_image(image),
            None => Prompt::from(line),
        };
        sprout.provide_user_response(message);

        chat_turn(&mut sprout, &mut print_stream).await?;
    }
    Ok(())
}

/// Runs one turn of the chat. A failed turn leaves the sprout usable, so it is reported
/// and the chat goes on; any other error ends the session.
async fn chat_turn(sprout: &mut Sprout, print_stream: &mut dyn FnMut(&str)) -> Result<()> {
    match sprout.conversation_turn(Some(print_stream)).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_turn_failure() => {
            error!("Turn failed: {}", e);
            eprintln!("The turn failed, please try again.");
            Ok(())
        }
        Err(e) => Err(e).context("Conversation turn failed"),
    }
}

async fn run_compile(args: &Args) -> Result<()> {
    let fetcher = create_fetcher(args);
    let ai = create_ai_provider(args, DEFAULT_JSON_MODEL).await?;
    let sprouts = fetcher.list_sprouts().await?;
    info!("Found {} sprouts below {}", sprouts.len(), args.root.display());

    let mut failures = 0;
    for path in sprouts {
        let mut sprout = Sprout::new(
            path.as_str(),
            fetcher.clone(),
            SproutOptions {
                ai: Some(ai.clone()),
                debug: args.debug,
            },
        );
        match sprout.compiled().await {
            Ok(true) => {
                info!("Skipping {} because it is already compiled.", path);
                continue;
            }
            Ok(false) => info!("Compiling {}", path),
            Err(e) => {
                error!("Could not inspect {}: {}", path, e);
                failures += 1;
                continue;
            }
        }
        if let Err(e) = sprout.compile().await {
            error!("Failed to compile {}: {}", path, e);
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{} sprouts failed to compile", failures);
    }
    Ok(())
}

async fn run_validate(args: &Args, path: &str) -> Result<()> {
    let mut sprout = Sprout::new(path, create_fetcher(args), SproutOptions::default());
    sprout
        .validate()
        .await
        .with_context(|| format!("Invalid sprout {}", path))?;
    let config = sprout.config().await?;
    let compiled = if sprout.compiled().await? {
        "compiled"
    } else {
        "not compiled"
    };
    println!("{}: {} ({})", sprout.name(), config.title, compiled);
    Ok(())
}

async fn run_list(args: &Args) -> Result<()> {
    for path in create_fetcher(args).list_sprouts().await? {
        println!("{}", path);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logging::setup_logging(args.verbose);

    match &args.command {
        Command::Chat { path, image } => run_chat(&args, path, image.as_deref()).await,
        Command::Compile => run_compile(&args).await,
        Command::Validate { path } => run_validate(&args, path).await,
        Command::List => run_list(&args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use sprout::llm::{ChunkStream, CompletionRequest};
    use sprout::{MemoryFetcher, SproutError};

    /// Derives the starter state, then fails every streamed turn.
    struct DroppedConnection;

    #[async_trait]
    impl CompletionProvider for DroppedConnection {
        async fn complete(&self, _request: &CompletionRequest) -> sprout::Result<String> {
            Ok(r#"{"count": 0}"#.to_string())
        }

        async fn complete_stream(
            &self,
            _request: &CompletionRequest,
        ) -> sprout::Result<Box<dyn ChunkStream>> {
            Err(SproutError::TransportStream("connection reset".to_string()))
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.len()
        }
    }

    fn counter(ai: Option<Arc<AiProvider>>) -> Sprout {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let fetcher = MemoryFetcher::new(false)
            .with_file("counter/config.json", r#"{"title": "Counter"}"#, t)
            .with_file("counter/instructions.md", "Count the increments.", t)
            .with_file("counter/schema.ts", "type State = { count: number }", t);
        Sprout::new("counter", Arc::new(fetcher), SproutOptions { ai, debug: false })
    }

    #[tokio::test]
    async fn test_failed_opening_turn_keeps_chat_going() {
        let env = Environment::from([("openai_api_key".to_string(), "key".to_string())]);
        let ai = AiProvider::new(
            DEFAULT_JSON_MODEL.parse().unwrap(),
            env,
            Arc::new(DroppedConnection),
        );
        let mut sprout = counter(Some(Arc::new(ai)));
        let mut printed = String::new();
        let mut print_stream = |text: &str| printed.push_str(text);

        assert!(chat_turn(&mut sprout, &mut print_stream).await.is_ok());
        assert_eq!(sprout.states(), &[json!({"count": 0})]);

        sprout.provide_user_response("increment");
        assert!(chat_turn(&mut sprout, &mut print_stream).await.is_ok());
        assert_eq!(sprout.states().len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_error_ends_chat() {
        let mut sprout = counter(None);
        let mut print_stream = |_: &str| {};
        assert!(chat_turn(&mut sprout, &mut print_stream).await.is_err());
    }
}
