use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rbm_stream::{
    create_router, AppState, BackpressurePolicy, Config, LoopbackOptions, LoopbackTransport,
    NatsTransport, SessionEvent, SessionManager, Transport, WavFileSource,
};
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "rbm-stream")]
#[command(about = "Stream audio frames to an inference backend and collect classifications")]
struct Cli {
    /// Config file (extension optional)
    #[arg(short, long, default_value = "config/rbm-stream")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control API against the configured NATS backend
    Serve,

    /// Stream a WAV file through one session and print each classification
    Stream {
        /// WAV file to stream
        wav: String,

        /// Credential for the handshake (defaults to the configured token)
        #[arg(short, long)]
        token: Option<String>,

        /// Use the in-process loopback backend instead of NATS
        #[arg(long)]
        loopback: bool,

        /// Release frames at the hop interval like a live device
        #[arg(long)]
        paced: bool,

        /// What to do when the transmission queue is full
        #[arg(long, default_value = "wait")]
        policy: BackpressurePolicy,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let cfg = Config::load(&cli.config).context("Failed to load configuration")?;
    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Stream {
            wav,
            token,
            loopback,
            paced,
            policy,
        } => stream(cfg, &wav, token, loopback, paced, policy).await,
    }
}

async fn connect_nats(cfg: &Config) -> Result<Arc<dyn Transport>> {
    let transport = NatsTransport::connect(&cfg.transport.nats_url, &cfg.transport.subject_prefix)
        .await
        .context("Failed to connect to inference backend")?;
    Ok(Arc::new(transport))
}

async fn serve(cfg: Config) -> Result<()> {
    let transport = connect_nats(&cfg).await?;
    let manager = SessionManager::new(transport, cfg.stream_settings());
    let state = AppState::new(manager.clone(), cfg.session.to_session_config());
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("HTTP server failed")?;

    info!("Shutting down; closing live sessions");
    manager.shutdown().await;
    Ok(())
}

async fn stream(
    cfg: Config,
    wav: &str,
    token: Option<String>,
    loopback: bool,
    paced: bool,
    policy: BackpressurePolicy,
) -> Result<()> {
    let mut config = cfg.session.to_session_config();
    if let Some(token) = token {
        config.auth_token = token;
    }

    let transport: Arc<dyn Transport> = if loopback {
        info!("Using loopback backend");
        Arc::new(LoopbackTransport::new(LoopbackOptions::default()))
    } else {
        connect_nats(&cfg).await?
    };

    let path = shellexpand::tilde(wav);
    let mut source = WavFileSource::open(&*path, &config, paced)
        .with_context(|| format!("Failed to open {}", path))?;

    let manager = SessionManager::new(transport, cfg.stream_settings());
    let mut handle = manager.start_session(config).await?;
    let session_id = handle.session_id.clone();

    let printer = tokio::spawn(async move {
        while let Some(event) = handle.events.recv().await {
            match event {
                SessionEvent::Active { session_id } => println!("session {session_id} active"),
                SessionEvent::Result(result) => match result.argmax() {
                    Some(class) => println!(
                        "frame {:>6}  class {:>3}  score {:.4}",
                        result.sequence,
                        class,
                        result.top_score().unwrap_or(f32::NAN)
                    ),
                    None => println!("frame {:>6}  no scores", result.sequence),
                },
                SessionEvent::MissingResult(missing) => {
                    println!("frame {:>6}  missing", missing.sequence)
                }
                SessionEvent::Closed(report) => {
                    println!(
                        "session closed: {} sent, {} discarded, {} results abandoned",
                        report.frames_sent, report.frames_discarded, report.results_abandoned
                    );
                    break;
                }
                SessionEvent::Failed { cause, .. } => {
                    println!("session failed: {cause}");
                    break;
                }
            }
        }
    });

    let summary = manager.run_capture(&session_id, &mut source, policy).await?;
    info!(
        "Captured {} frames ({} accepted, {} dropped)",
        summary.frames_read, summary.frames_accepted, summary.frames_dropped
    );

    let closed = manager.close_session(&session_id).await;
    printer.await.context("Event printer panicked")?;
    closed?;
    Ok(())
}
