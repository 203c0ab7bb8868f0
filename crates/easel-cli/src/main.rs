use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use easel_contracts::events::EventWriter;
use easel_contracts::RequestKind;
use easel_engine::assets::media::{decode_data_url, extension_for_mime, guess_image_mime, load_source};
use easel_engine::assets::MigrationReport;
use easel_engine::persistence::deserialize_set;
use easel_engine::{
    default_provider_registry, ChatOutcome, DispatchIntent, Engine, EngineConfig, EngineContext,
    FileSessionBackend, FsBlobStore, GroupOutcome, SessionBackend, TokioClock,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "easel-rs", version, about = "Easel generation engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Chat(ChatArgs),
    Migrate(CommonArgs),
    Sessions(CommonArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Base URL of a provider controller; without it only `dryrun` exists.
    #[arg(long, env = "EASEL_CONTROLLER_URL")]
    controller: Option<String>,
    #[arg(long, default_value = "default")]
    session_set: String,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    multiplier: Option<u32>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long = "source")]
    sources: Vec<String>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    provider: Option<String>,
    #[command(flatten)]
    common: CommonArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed starting async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => run_generate(args).await,
            Command::Chat(args) => {
                run_chat(args).await?;
                Ok(0)
            }
            Command::Migrate(args) => run_migrate(args).await,
            Command::Sessions(args) => {
                list_sessions(args).await?;
                Ok(0)
            }
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn build_engine(common: &CommonArgs, provider: Option<&str>) -> Result<Engine> {
    let mut config = EngineConfig::load(common.config.as_deref())?;
    let providers = default_provider_registry(common.controller.as_deref());
    if let Some(provider) = provider {
        config.provider = provider.to_string();
    }
    if providers.get(&config.provider).is_none() {
        bail!(
            "unknown provider '{}' (available: {})",
            config.provider,
            providers.names().join(", ")
        );
    }

    let events_path = common
        .events
        .clone()
        .unwrap_or_else(|| common.out.join("events.jsonl"));
    let run_id = uuid::Uuid::new_v4().to_string();
    let sink = Arc::new(EventWriter::new(events_path, run_id));
    let blobs = Arc::new(FsBlobStore::new(common.out.join("blobs")));
    let ctx = EngineContext::new(config, sink, blobs, providers, Arc::new(TokioClock));
    let backend = Arc::new(FileSessionBackend::new(&common.out));
    let mut engine = Engine::new(ctx).with_persistence(backend, &common.session_set);
    engine.start().await?;
    Ok(engine)
}

async fn run_generate(args: RunArgs) -> Result<i32> {
    let mut engine = build_engine(&args.common, args.provider.as_deref()).await?;
    if let Some(multiplier) = args.multiplier {
        engine
            .context()
            .update_config(|config| config.multiplier = multiplier)?;
    }

    let mut sources = Vec::with_capacity(args.sources.len());
    for source in &args.sources {
        sources.push(load_source(source).await?);
    }
    let mut intent = DispatchIntent::new(args.prompt.clone()).with_sources(sources);
    if let Some(kind) = args.kind.as_deref() {
        let kind: RequestKind = kind.parse().map_err(anyhow::Error::msg)?;
        intent = intent.with_kind(kind);
    }

    let ticket = match engine.dispatch(intent) {
        Ok(ticket) => ticket,
        Err(err) => {
            eprintln!("{}", err.user_message());
            engine.shutdown().await?;
            return Ok(2);
        }
    };
    let outcome = ticket.settled().await;
    print_outcome(engine.context(), &outcome);
    if engine.context().config().auto_download {
        for path in download_results(engine.context(), &outcome, &args.common.out).await? {
            println!("Saved {}", path.display());
        }
    }
    engine.shutdown().await?;
    Ok(if outcome.failed() == 0 { 0 } else { 1 })
}

async fn run_chat(args: ChatArgs) -> Result<()> {
    let mut engine = build_engine(&args.common, args.provider.as_deref()).await?;
    let out_dir = args.common.out.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    println!("Easel chat started. Type /help for commands.");
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let outcome = match engine.handle_text(&line).await {
            Ok(outcome) => outcome,
            Err(err) => {
                println!("{err:#}");
                continue;
            }
        };
        match outcome {
            ChatOutcome::Noop => {}
            ChatOutcome::Help(commands) => println!("Commands: {}", commands.join(" ")),
            ChatOutcome::Dispatched(ticket) => {
                println!(
                    "Started {} x{} (group {})",
                    ticket.kind,
                    ticket.message_ids.len(),
                    ticket.group_id
                );
                let ctx = Arc::clone(engine.context());
                let out_dir = out_dir.clone();
                tokio::spawn(async move {
                    let outcome = ticket.settled().await;
                    print_outcome(&ctx, &outcome);
                    if ctx.config().auto_download {
                        match download_results(&ctx, &outcome, &out_dir).await {
                            Ok(paths) => {
                                for path in paths {
                                    println!("Saved {}", path.display());
                                }
                            }
                            Err(err) => println!("Download failed: {err:#}"),
                        }
                    }
                });
            }
            ChatOutcome::SettingsUpdated(config) => println!(
                "Settings: provider={} tier={} aspect={} multiplier={} auto_download={} web_search={}",
                config.provider,
                config.model_tier,
                config.aspect_ratio,
                config.multiplier,
                config.auto_download,
                config.web_search
            ),
            ChatOutcome::SessionChanged(session_id) => println!("Session {session_id}"),
            ChatOutcome::Sessions(sessions) => {
                for session in sessions {
                    let marker = if session.is_current { "*" } else { " " };
                    println!(
                        "{marker} {} {} ({} messages)",
                        session.session_id, session.name, session.message_count
                    );
                }
            }
            ChatOutcome::ActiveImage(message_id) => println!("Active image set ({message_id})"),
            ChatOutcome::Migrated(report) => print_migration(&report),
            ChatOutcome::Unknown(raw) => println!("Unknown command: {raw}"),
        }
    }

    engine.context().assets.wait_for_uploads().await;
    if let Some(receipt) = engine.shutdown().await? {
        println!("Saved sessions (version {})", receipt.version);
    }
    Ok(())
}

async fn run_migrate(args: CommonArgs) -> Result<i32> {
    let mut engine = build_engine(&args, None).await?;
    let report = engine.migrate().await;
    print_migration(&report);
    engine.shutdown().await?;
    Ok(if report.failed == 0 { 0 } else { 1 })
}

async fn list_sessions(args: CommonArgs) -> Result<()> {
    let backend = FileSessionBackend::new(&args.out);
    let Some(set) = backend.load(&args.session_set).await? else {
        println!("No saved sessions in {}", args.out.display());
        return Ok(());
    };
    let (sessions, current) = deserialize_set(set);
    for session in sessions {
        let marker = if current.as_deref() == Some(session.session_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {} {} ({} messages, last active {})",
            session.session_id,
            session.name,
            session.messages.len(),
            session.last_activity.to_rfc3339()
        );
    }
    Ok(())
}

fn print_outcome(ctx: &EngineContext, outcome: &GroupOutcome) {
    for settlement in &outcome.settlements {
        match &settlement.error {
            None => {
                let model = settlement.model.as_deref().unwrap_or("unknown");
                let fallback = settlement
                    .fallback_from
                    .as_deref()
                    .map(|from| format!(" (fell back from {from})"))
                    .unwrap_or_default();
                let content = ctx
                    .store
                    .message(&settlement.message_id)
                    .map(|message| message.content)
                    .unwrap_or_default();
                println!("[ok] {} via {model}{fallback}: {content}", settlement.kind);
            }
            Some(err) => println!("[failed] {}: {}", settlement.kind, err.user_message()),
        }
    }
    println!(
        "{} succeeded, {} failed",
        outcome.succeeded(),
        outcome.failed()
    );
}

fn print_migration(report: &MigrationReport) {
    println!(
        "Migration {:?}: scanned {}, uploaded {}, failed {}",
        report.status, report.scanned, report.uploaded, report.failed
    );
}

/// Writes every successful image result into `<out>/downloads/`.
async fn download_results(
    ctx: &EngineContext,
    outcome: &GroupOutcome,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let dir = out_dir.join("downloads");
    let mut written = Vec::new();
    for settlement in outcome.settlements.iter().filter(|s| s.is_success()) {
        if !settlement.kind.expects_image() {
            continue;
        }
        let Some(message) = ctx.store.message(&settlement.message_id) else {
            continue;
        };
        let (bytes, mime) = if let Some(data) = message.image_data.as_deref() {
            decode_data_url(data)?
        } else if let Some(path) = message
            .image_url
            .as_deref()
            .and_then(|url| url.strip_prefix("file://"))
        {
            let path = Path::new(path);
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed reading {}", path.display()))?;
            (bytes, guess_image_mime(path).to_string())
        } else {
            continue;
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed creating {}", dir.display()))?;
        let short: String = message.id.chars().take(8).collect();
        let path = dir.join(format!(
            "{}-{short}.{}",
            settlement.kind,
            extension_for_mime(&mime)
        ));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed writing {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn run_accepts_repeated_sources() {
        let cli = Cli::parse_from([
            "easel-rs",
            "run",
            "--prompt",
            "merge these",
            "--out",
            "/tmp/easel",
            "--kind",
            "blend",
            "--source",
            "a.png",
            "--source",
            "b.png",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.sources, vec!["a.png", "b.png"]);
        assert_eq!(args.kind.as_deref(), Some("blend"));
        assert_eq!(args.common.session_set, "default");
    }

    #[test]
    fn sessions_requires_an_output_dir() {
        assert!(Cli::try_parse_from(["easel-rs", "sessions"]).is_err());
        assert!(Cli::try_parse_from(["easel-rs", "sessions", "--out", "/tmp/easel"]).is_ok());
    }
}
