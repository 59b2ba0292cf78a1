use std::io;
use tracing_subscriber::fmt::SubscriberBuilder;

/// Logs go to stderr; stdout carries the conversation.
pub fn setup_logging(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else if verbose {
        tracing_subscriber::EnvFilter::new("sprout=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("sprout=info,warn")
    };

    let subscriber: SubscriberBuilder<_, _, _, fn() -> Box<dyn io::Write + Send>> =
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_writer(|| Box::new(io::stderr()) as Box<dyn io::Write + Send>);

    subscriber.init();
}
