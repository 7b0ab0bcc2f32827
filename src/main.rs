use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use whisper_server::{
    create_router, AppState, Config, ConversationStore, KeyValueStore, LocalTransport,
    MemoryStore, MockSpeech, NatsStore, NatsTransport, SessionRegistry, SessionServices,
    StorageBackend, SuspendStore, Transport, TrustedHeaderAuthenticator,
};

#[derive(Parser)]
#[command(name = "whisper-server")]
#[command(about = "Serve whisper conversations")]
struct Args {
    /// Config file, extension optional
    #[arg(short, long, default_value = "config/whisper-server")]
    config: String,

    /// End running sessions at exit instead of suspending them for another instance
    #[arg(long)]
    end_sessions_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg = Config::load_or_default(&args.config)?;

    info!("Whisper Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    let store: Arc<dyn KeyValueStore> = match cfg.storage.backend {
        StorageBackend::Nats => {
            let Some(url) = &cfg.transport.nats_url else {
                bail!("storage.backend = \"nats\" needs transport.nats_url");
            };
            Arc::new(
                NatsStore::connect(url, &cfg.storage.bucket, cfg.storage.key_prefix.clone())
                    .await
                    .context("Failed to open NATS storage")?,
            )
        }
        StorageBackend::Memory => {
            warn!("Using in-process storage, suspended sessions will not outlive this process");
            Arc::new(MemoryStore::new(cfg.storage.key_prefix.clone()))
        }
    };
    let transport: Arc<dyn Transport> = match &cfg.transport.nats_url {
        Some(url) => Arc::new(
            NatsTransport::connect(url, cfg.transport.subject_prefix.clone())
                .await
                .context("Failed to start NATS transport")?,
        ),
        None => {
            warn!("No NATS server configured, using the in-process transport");
            Arc::new(LocalTransport::new())
        }
    };

    let session_config = cfg.session.to_session_config();
    let suspend = SuspendStore::new(
        Arc::clone(&store),
        session_config.packet_ttl,
        session_config.transcript_ttl,
    );
    let registry = Arc::new(SessionRegistry::new(SessionServices {
        transport,
        speech: Arc::new(MockSpeech::new()),
        suspend,
        config: session_config,
    }));

    let resumer = Arc::clone(&registry);
    let resume_task = tokio::spawn(async move {
        let count = resumer.resume_suspended_sessions().await;
        info!("Resumed {} suspended sessions", count);
    });

    let state = AppState::new(
        Arc::clone(&registry),
        ConversationStore::new(store),
        Arc::new(TrustedHeaderAuthenticator),
    );
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // nothing may be resumed here once handoff starts
    registry.close();
    if let Err(e) = resume_task.await {
        warn!("Resume task failed: {}", e);
    }

    if args.end_sessions_on_exit {
        info!("Ending all sessions");
    } else {
        info!("Suspending all sessions for handoff");
    }
    let count = registry.shutdown(args.end_sessions_on_exit).await;
    info!("Stopped {} sessions, exiting", count);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
