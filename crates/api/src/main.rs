use std::sync::Arc;

use anyhow::Context;

use herald_api::app::{self, services};
use herald_infra::AppConfig;
use herald_infra::dispatch::{DispatchExecutor, MailerSendProvider};
use herald_infra::workers::NotificationWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let store = services::connect_store(&config).await?;

    let worker = if config.worker.enabled {
        let provider = MailerSendProvider::new(config.mailersend.clone())
            .context("failed to build MailerSend client")?;
        let executor = DispatchExecutor::new(store.clone(), provider);
        Some(Arc::new(NotificationWorker::new(executor, config.worker.clone())).spawn())
    } else {
        tracing::info!("notification worker disabled (NOTIF_WORKER_ENABLED=false)");
        None
    };

    let app = app::build_app(Arc::new(services::AppServices::new(store)));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
