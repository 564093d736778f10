use anyhow::{Context, Result};
use clap::Parser;
use pose_coach::capture::{self, WavFileCapture};
use pose_coach::{
    create_router, AnalyzerSet, AppState, CoachingEngine, Config, EngineEvent, NatsTransport,
    SharedConsentStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pose-coach", version, about = "Real-time multi-modal exercise coaching engine")]
struct Args {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/pose-coach")]
    config: String,

    /// Session identifier (defaults to the configured or a generated id)
    #[arg(long)]
    session_id: Option<String>,

    /// Stream this 16-bit WAV file as the microphone
    #[arg(long)]
    audio_file: Option<PathBuf>,

    /// Run the HTTP control API instead of a single session
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    if let Some(session_id) = args.session_id {
        cfg.session.session_id = session_id;
    }

    info!("Pose Coach v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    if args.serve {
        serve(cfg).await
    } else {
        run_session(cfg, args.audio_file).await
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP control API listening on {}", addr);

    let router = create_router(AppState::new(cfg));
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")
}

async fn run_session(cfg: Config, audio_file: Option<PathBuf>) -> Result<()> {
    let consent = SharedConsentStore::new(cfg.privacy.default_policy.clone());
    let engine = CoachingEngine::start(
        &cfg,
        Box::new(NatsTransport::new(cfg.session.session_id.clone())),
        AnalyzerSet::standard(cfg.audio.clone()),
        Arc::new(consent),
    );

    let mut events = engine.subscribe();
    engine.connect()?;

    let stop = CancellationToken::new();
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            stop.cancel();
        })
    };

    let capture = match audio_file {
        Some(path) => Some(WavFileCapture::open(&path, Duration::from_millis(20))?),
        None => None,
    };

    {
        let pump = async {
            match capture {
                Some(capture) => {
                    capture::pump_audio(capture, &engine, &stop).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(pump);

        let mut pumping = true;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = &mut pump, if pumping => {
                    pumping = false;
                    info!("Audio file finished, press Ctrl-C to end the session");
                }
                event = events.recv() => match event {
                    Ok(EngineEvent::Insight(insight)) => {
                        for rec in &insight.recommendations {
                            info!("[{:?}] {}: {}", rec.priority, rec.title, rec.description);
                        }
                    }
                    Ok(EngineEvent::Reply(reply)) => info!("Coach: {:?}", reply),
                    Ok(EngineEvent::Transcription(t)) => info!("You: {}", t.text),
                    Ok(EngineEvent::Error(e)) => warn!("{}", e.message),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} engine events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    ctrl_c.abort();
    let metrics = engine.shutdown().await;
    info!(
        "Session ended: {} insights, {} messages sent, {:.1} results/s",
        metrics.insights_emitted, metrics.messages_sent, metrics.throughput_per_sec
    );

    Ok(())
}
