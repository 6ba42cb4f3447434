use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chorus_gateway::api::{ApiServer, ApiState};
use chorus_gateway::config::{LogFormat, ServerConfig};
use chorus_gateway::db::{self, MessageRepo, RequestLogRepo};
use chorus_gateway::providers::ProviderKind;
use chorus_gateway::{
    ChatRequest, ChatService, ChunkSink, Config, HistoryCompressor, ProviderRegistry,
};

/// Chorus - streaming chat gateway for GigaChat, Groq and Ollama
#[derive(Parser)]
#[command(name = "chorus", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// `SQLite` database path (overrides config)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Default provider: gigachat, groq or ollama (overrides config)
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server (default)
    Serve,
    /// List configured providers and their models
    Providers,
    /// Send one message and stream the reply to stdout
    Chat {
        /// Message text
        message: String,
        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
        /// Model override for this message
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Compress a session's history now
    Compress {
        /// Session to compress
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(cli.verbose, &config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(path) = &cli.database {
        config.server.database_path.clone_from(path);
    }
    if let Some(provider) = cli.provider {
        config.providers.default = provider;
    }
    config.validate()?;
    Ok(config)
}

/// `-v` flags take precedence over the configured level; `RUST_LOG` over both
fn init_tracing(verbose: u8, config: &Config) {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "info,chorus_gateway=debug",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Providers => list_providers(config).await,
        Command::Chat {
            message,
            session,
            model,
        } => chat_once(config, message, session, model).await,
        Command::Compress { session } => compress(config, &session).await,
    }
}

async fn build_service(config: Config) -> anyhow::Result<(ChatService, db::DbPool, ServerConfig)> {
    let Config {
        server,
        providers,
        history_limit,
        compression,
        ..
    } = config;

    let pool = db::init(&server.database_path)?;
    let registry = ProviderRegistry::from_config(providers).await?;

    let service = ChatService::new(
        Arc::new(registry),
        Arc::new(MessageRepo::new(pool.clone())),
        RequestLogRepo::new(pool.clone()),
        HistoryCompressor::new(compression),
    )
    .with_history_limit(history_limit);

    Ok((service, pool, server))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.server.port,
        database = %config.server.database_path.display(),
        "starting chorus gateway"
    );

    let (service, pool, server_config) = build_service(config).await?;
    let shutdown = CancellationToken::new();

    let mut server = ApiServer::new(ApiState::new(service, pool, server_config)).spawn(shutdown.clone());

    tokio::select! {
        result = &mut server => {
            result.context("API server task panicked")??;
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    server.await.context("API server task panicked")??;
    Ok(())
}

async fn list_providers(config: Config) -> anyhow::Result<()> {
    let registry = ProviderRegistry::from_config(config.providers).await?;

    for info in registry.list_info() {
        let marker = if info.is_default { "*" } else { " " };
        println!("{marker} {:<10} current: {}", info.name, info.current_model);
        for model in info.models {
            println!("    {model}");
        }
    }
    Ok(())
}

/// Writes fragments straight to stdout
struct StdoutSink;

#[async_trait]
impl ChunkSink for StdoutSink {
    async fn on_chunk(&mut self, fragment: &str) -> chorus_gateway::Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(fragment.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

async fn chat_once(
    config: Config,
    message: String,
    session: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let (service, _pool, _) = build_service(config).await?;

    let mut request = ChatRequest::new(message);
    request.session_id = session;
    request.model = model;

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = service.stream_chat(request, &mut StdoutSink, &cancel).await;
    ctrl_c.abort();
    let outcome = outcome?;

    println!();
    eprintln!(
        "session: {}  provider: {}  model: {}  tokens: {}/{}  {} ms",
        outcome.session_id,
        outcome.provider,
        outcome.model,
        outcome.tokens_input,
        outcome.tokens_output,
        outcome.duration_ms
    );
    Ok(())
}

async fn compress(config: Config, session: &str) -> anyhow::Result<()> {
    let (service, _pool, _) = build_service(config).await?;
    let report = service
        .compress_session(session, None, &CancellationToken::new())
        .await?;

    println!(
        "{session}: {} round(s), {} message(s) compressed",
        report.rounds, report.messages_compressed
    );
    Ok(())
}
