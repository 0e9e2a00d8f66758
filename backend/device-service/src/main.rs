use std::io;

use actix_web::{web, App, HttpResponse, HttpServer};
use db_pool::DbConfig;
use device_service::{handlers, Config};
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn health(pool: web::Data<PgPool>) -> HttpResponse {
    match sqlx::query("SELECT 1").execute(pool.get_ref()).await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({"ok": true})),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "ok": false,
            "error": e.to_string(),
        })),
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!("Starting device-service v{}", env!("CARGO_PKG_VERSION"));

    let db_cfg = DbConfig::from_env("device-service", config.database.url.clone());
    db_cfg.log_config();
    let pool = db_pool::create_pool(&db_cfg).await.map_err(|e| {
        tracing::error!(error = %e, "database pool creation failed");
        io::Error::new(io::ErrorKind::Other, e)
    })?;

    let bind_address = (config.app.host.clone(), config.app.port);
    tracing::info!(host = %bind_address.0, port = bind_address.1, "starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(config.clone()))
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/health", web::get().to(health))
            .configure(handlers::routes)
    })
    .bind(bind_address)?
    .run()
    .await
}
