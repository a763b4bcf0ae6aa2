//! # bookrelay - Main Application Entry Point
//!
//! Starts the audiobook relay: an Actix-web server that transcodes books on
//! demand and streams them to speakers with a per-session gain stage.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the server and every pipeline run on the tokio runtime
//! - **Arc**: one `SessionManager` shared by all worker threads
//! - **trait objects**: the manager receives `Arc<dyn ProcessLauncher>` and
//!   `Arc<dyn AudioLibrary>`, so nothing here is a global singleton
//! - **static**: the shutdown flag set from signal handlers
//!
//! ## Application Architecture:
//! - **config**: TOML file + `APP__` environment variables
//! - **proxy**: one transcoding pipeline per stream request
//! - **handlers**: `/stream`, `/volume`, `/status`, `/session`, `/health`, `/metrics`
//! - **middleware**: request logging and per-route metrics

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use bookrelay::audio::process::FfmpegLauncher;
use bookrelay::config::AppConfig;
use bookrelay::library::TemplateLibrary;
use bookrelay::proxy::SessionManager;
use bookrelay::state::AppState;
use bookrelay::{handlers, middleware};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT/SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## What this function does:
/// 1. **Loads configuration** from config.toml and the environment
/// 2. **Sets up logging** with tracing
/// 3. **Builds the session manager** with the real ffmpeg launcher
/// 4. **Runs the HTTP server** until a shutdown signal
/// 5. **Stops every pipeline** so no ffmpeg child outlives the relay
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok(): a missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting bookrelay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        ffmpeg = %config.transcoder.ffmpeg_path,
        bitrate_kbps = config.transcoder.bitrate_kbps,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );

    let sessions = Arc::new(SessionManager::new(
        Arc::new(TemplateLibrary::from_config(&config.library)),
        Arc::new(FfmpegLauncher::new(&config.transcoder.ffmpeg_path)),
        config.transcoder.pipeline_settings(),
        config.performance.max_concurrent_sessions,
    ));
    let app_state = AppState::new(config.clone(), sessions.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Speakers and web controllers fetch from other origins
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .expose_headers(vec![handlers::SESSION_ID_HEADER])
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure)
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Open streams never end on their own, so don't wait for them
            server_handle.stop(false).await;
        }
    }

    let stopped = sessions.stop_all();
    info!(sessions = stopped, "Server stopped gracefully");
    Ok(())
}

/// ## Environment Variables:
/// - `RUST_LOG`: e.g. "debug", "bookrelay=trace"
/// - If not set, defaults to "bookrelay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookrelay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) = match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
            ) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
