use anyhow::Context;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use episodic::cli::{
    handle_cleanup, handle_exclude, handle_pin, handle_record, handle_search, Cli, Command,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not resolve home directory, pass --data-dir")?
            .join(".episodic"),
    };
    tokio::fs::create_dir_all(&base_dir)
        .await
        .with_context(|| format!("creating {}", base_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &base_dir, "episodic.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    match cli.command {
        Command::Record {
            retention_days,
            hardware_accelerated,
            track_files,
            privacy_patterns,
        } => {
            handle_record(
                base_dir,
                retention_days,
                hardware_accelerated,
                track_files,
                privacy_patterns,
            )
            .await
        }
        Command::Search {
            term,
            expand,
            embeddings,
            json,
        } => handle_search(base_dir, term, expand, embeddings, json).await,
        Command::Cleanup {
            retention_days,
            dry_run,
        } => handle_cleanup(base_dir, retention_days, dry_run).await,
        Command::Pin { episode_id, unpin } => handle_pin(base_dir, episode_id, unpin).await,
        Command::Exclude { bundle, include } => handle_exclude(base_dir, bundle, include).await,
    }
}
