mod api;
mod config;
mod external;
mod jobs;
mod object_store;
mod playback;
mod scan;
mod state;
mod subtitles;
mod transcode;
mod utils;
mod watch;
mod worker;

use std::sync::Arc;

use axum::Router;
use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_path, MediaPaths};
use external::MetadataResolver;
use jobs::{Job, JobQueue, JobQueueConfig};
use library::Library;
use object_store::{ObjectStore, S3Gateway};
use parking_lot::RwLock;
use playback::PlaybackResolver;
use reqwest::Client;
use state::{AppState, ScanStatus};
use subtitles::SubtitleNormalizer;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use transcode::{FfmpegEncoder, TranscodeEngine};
use tracing::{info, warn};
use worker::PipelineJobs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.server.index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let library = Library::open(&index_path)?;

    let paths = MediaPaths::resolve(&config_path, &config.media);
    std::fs::create_dir_all(&paths.renditions_dir)?;
    std::fs::create_dir_all(&paths.subtitles_dir)?;

    let external_client = Client::builder().user_agent("reelvault/0.1").build()?;
    let object_store: Option<Arc<dyn ObjectStore>> = if config.object_store.is_configured() {
        match S3Gateway::new(external_client.clone(), &config.object_store) {
            Ok(gateway) => Some(Arc::new(gateway)),
            Err(err) => {
                warn!("Object store disabled: {}", err);
                None
            }
        }
    } else {
        info!("Object store not configured; remote media disabled.");
        None
    };

    let resolver = MetadataResolver::new(external_client, &config.metadata);
    if !resolver.is_enabled() {
        info!("Metadata provider not configured; filename-derived metadata only.");
    }
    let playback = PlaybackResolver::new(object_store.clone(), &config.media.local_media_prefix);
    let transcoder = TranscodeEngine::new(
        Arc::new(FfmpegEncoder::new(&config.transcode.ffmpeg_path)),
        paths.renditions_dir.clone(),
        &config.media.renditions_prefix,
    );
    let subtitles = SubtitleNormalizer::new(&config.subtitles.fallback_encoding)?;
    let jobs = JobQueue::open(library.db(), JobQueueConfig::from(&config.jobs))?;

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let state = AppState {
        library,
        config: Arc::new(config),
        paths: Arc::new(paths),
        object_store,
        resolver,
        playback,
        transcoder,
        subtitles,
        jobs,
        scan_status: Arc::new(RwLock::new(ScanStatus::Idle)),
        watcher: Arc::new(RwLock::new(None)),
    };

    state.jobs.start(Arc::new(PipelineJobs::new(state.clone())));
    if state.paths.media_root.is_some() || state.object_store.is_some() {
        if let Err(err) = state.jobs.enqueue(Job::Scan) {
            warn!("Failed to queue startup scan: {}", err);
        }
    } else {
        info!("No media sources configured yet; set media.media_root or object_store in the config.");
    }
    watch::configure_watcher(&state);

    let files = ServeDir::new(&state.paths.static_root);
    let app = Router::new().nest("/api/v1", api_router(state.clone()));
    let app = if state.config.media.public_prefix == "/" {
        app.fallback_service(files)
    } else {
        app.nest_service(&state.config.media.public_prefix, files)
    };
    let app = app
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
