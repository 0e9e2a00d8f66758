use std::sync::Arc;

use db_pool::{DbConfig, SessionSource};
use device_worker::clients::{
    build_http_client, DeviceControlApi, EmailApi, HttpDeviceControlClient, HttpTenancyClient,
    ResendEmailClient, TenancyApi,
};
use device_worker::dispatch::DeviceEventHandler;
use device_worker::poller::{OutboxPoller, PollerConfig};
use device_worker::projector::SqlxReadModelProjector;
use device_worker::sagas::{DeviceRetirementSaga, SqlxSagaStateStore};
use device_worker::WorkerConfig;
use resilience::CircuitBreaker;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::SqlxOutboxRepository;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!("Starting device-worker v{}", env!("CARGO_PKG_VERSION"));

    let db_cfg = DbConfig::from_env("device-worker", config.database_url.clone());
    db_cfg.log_config();
    let pool = db_pool::create_pool(&db_cfg).await?;

    let http = build_http_client(&config)?;
    let tenancy: Arc<dyn TenancyApi> = Arc::new(HttpTenancyClient::new(
        http.clone(),
        config.tenancy_service_url.clone(),
        config.tenancy_service_token.clone(),
    ));
    let email: Arc<dyn EmailApi> = Arc::new(ResendEmailClient::new(
        http.clone(),
        config.resend_api_key.clone(),
        config.resend_from.clone(),
    ));
    let device_control: Arc<dyn DeviceControlApi> = Arc::new(HttpDeviceControlClient::new(
        http,
        config.device_service_url.clone(),
        config.device_service_token.clone(),
    ));

    // One breaker per external dependency, shared by every call site.
    let tenancy_breaker = CircuitBreaker::new("tenancy", config.circuit_breaker.clone());
    let email_breaker = CircuitBreaker::new("resend", config.circuit_breaker.clone());

    let projector = SqlxReadModelProjector::new(tenancy.clone(), tenancy_breaker.clone());
    let saga = DeviceRetirementSaga::new(
        SqlxSagaStateStore,
        tenancy.clone(),
        email.clone(),
        device_control,
        tenancy_breaker.clone(),
        email_breaker.clone(),
    );
    let handler = DeviceEventHandler::new(
        projector,
        saga,
        tenancy,
        email,
        tenancy_breaker,
        email_breaker,
    );

    let poller = OutboxPoller::new(
        SqlxOutboxRepository,
        handler,
        SessionSource::Pool(pool),
        PollerConfig {
            poll_interval: config.poll_interval,
            retry: config.retry.clone(),
            ..Default::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    poller_task.await?;

    tracing::info!("device-worker stopped");
    Ok(())
}
