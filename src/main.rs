use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use guildledger::feed::latest_for;
use guildledger::replication::codec;
use guildledger::{
    AdminCommand, DiscordFeed, FeedReference, LedgerConfig, LedgerService, SnapshotFeed,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "guildledger")]
#[command(about = "Community economy state replicated through a chat channel")]
struct Cli {
    /// Bot token used to read and post to the feed channel
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service until Ctrl-C, reading `<actor> <command>` lines from stdin
    Serve,
    /// List the newest snapshot of every dataset on the feed
    Inspect,
    /// Print the records of one dataset snapshot
    Dump {
        dataset: String,
        /// Feed post to read instead of the newest one
        #[arg(long)]
        reference: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = LedgerConfig::from_env().context("Invalid LEDGER_* configuration")?;
    let feed = Arc::new(
        DiscordFeed::new(&cli.token, &config.feed_channel_id, config.request_timeout)
            .context("Failed to build Discord client")?,
    );

    match cli.command {
        Command::Serve => serve(config, feed).await,
        Command::Inspect => inspect(&config, feed.as_ref()).await,
        Command::Dump { dataset, reference } => dump(&config, feed.as_ref(), &dataset, reference).await,
    }
}

async fn serve(config: LedgerConfig, feed: Arc<DiscordFeed>) -> Result<()> {
    let service = LedgerService::open(config, feed)
        .await
        .context("Failed to start ledger service")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line(), if console_open => {
                match line {
                    Ok(Some(line)) => run_console_line(&service, &line).await,
                    Ok(None) => console_open = false,
                    Err(err) => {
                        error!(error = %err, "stdin console closed");
                        console_open = false;
                    }
                }
            }
        }
    }

    let report = service.shutdown().await.context("Final save failed")?;
    println!("Final save: {}", report);
    Ok(())
}

async fn run_console_line(service: &LedgerService, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Some((actor, command)) = line.split_once(char::is_whitespace) else {
        println!("usage: <actor> <command>");
        return;
    };

    let outcome = match AdminCommand::parse(command) {
        Ok(command) => service.admin().execute(actor, command).await,
        Err(err) => Err(err),
    };
    match outcome {
        Ok(message) => println!("{}", message),
        Err(err) => println!("Error: {}", err),
    }
}

async fn inspect(config: &LedgerConfig, feed: &dyn SnapshotFeed) -> Result<()> {
    let posts = feed
        .list_recent(config.history_scan_limit)
        .await
        .context("Failed to read feed history")?;
    println!("Scanned {} post(s)", posts.len());

    for spec in &config.datasets {
        match latest_for(&posts, spec.name()) {
            Some(post) => {
                let size = post
                    .objects
                    .iter()
                    .find(|object| object.name == spec.name())
                    .map(|object| object.size)
                    .unwrap_or_default();
                println!(
                    "{:<18} {} {} ({} bytes)",
                    spec.name(),
                    post.timestamp.to_rfc3339(),
                    post.reference,
                    size
                );
            }
            None => println!("{:<18} no snapshot", spec.name()),
        }
    }
    Ok(())
}

async fn dump(config: &LedgerConfig, feed: &dyn SnapshotFeed, dataset: &str, reference: Option<String>) -> Result<()> {
    let reference = match reference {
        Some(reference) => FeedReference::new(reference),
        None => {
            let posts = feed
                .list_recent(config.history_scan_limit)
                .await
                .context("Failed to read feed history")?;
            latest_for(&posts, dataset)
                .map(|post| post.reference.clone())
                .ok_or_else(|| anyhow!("No snapshot of '{}' in the last {} posts", dataset, config.history_scan_limit))?
        }
    };

    let fetched = feed
        .fetch(&reference, dataset)
        .await
        .with_context(|| format!("Failed to fetch '{}' from {}", dataset, reference))?;
    let records = codec::decode(dataset, &fetched.bytes)?;

    println!("{}", serde_json::to_string_pretty(&records)?);
    eprintln!(
        "{} record(s) from {} at {}",
        records.len(),
        fetched.reference,
        fetched.timestamp.to_rfc3339()
    );
    Ok(())
}
