use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use membership_service::config::Settings;
use membership_service::mail::create_transport;
use membership_service::membership::MemoryRepository;
use membership_service::server::{create_app, AppState};
use membership_service::shutdown::{listen_for_signals, start_background};
use membership_service::telemetry::init_telemetry;
use membership_service::template::TemplateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.log, &settings.otel)?;
    tracing::info!("Configuration loaded");

    // Mail templates and delivery backend
    let templates = TemplateStore::new();
    if let Some(dir) = &settings.templates.dir {
        templates
            .load_dir(dir)
            .await
            .with_context(|| format!("loading mail templates from {}", dir.display()))?;
    }
    let transport = create_transport(&settings.mail).await?;

    // Start the error sink and mail dispatcher loops
    let (background, coordinator) = start_background(
        &settings.mail,
        &settings.shutdown,
        transport,
        Arc::new(templates),
    )?;
    let shutdown = background.shutdown.clone();

    tokio::spawn(listen_for_signals(shutdown.clone()));
    let coordinator_handle = tokio::spawn(coordinator.run());

    let state = AppState::new(
        settings.clone(),
        Arc::new(MemoryRepository::with_demo_data()),
        background,
    );
    tracing::info!("Application state initialized");

    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Stop accepting requests as soon as shutdown is requested. Requests
    // still in flight either registered their tasks before the coordinator
    // closed the tracker, and are drained, or get a 503.
    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.requested().await })
        .await;

    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
        shutdown.request_shutdown("server error");
    }

    tracing::info!("Waiting for background tasks to finish...");
    let report = coordinator_handle
        .await
        .context("shutdown coordinator panicked")?;

    tracing::info!(
        mail_dropped = report.mail_dropped,
        errors_logged = report.errors_logged,
        "Server shutdown complete"
    );

    served?;
    Ok(())
}
