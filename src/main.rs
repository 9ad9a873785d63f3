use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use risk_lms::config::Config;
use risk_lms::issuer::{ArtifactRenderer, DisabledRenderer, HttpRenderer, Issuer};
use risk_lms::store::{pg, MemStore, PgStore, Store};
use risk_lms::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "risk_lms=info,axum=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = pg::connect(url).await?;
            let store = PgStore::new(pool);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store, data is lost on exit");
            Arc::new(MemStore::new())
        }
    };

    let renderer: Arc<dyn ArtifactRenderer> = match &config.render_service_url {
        Some(url) => Arc::new(HttpRenderer::new(url.clone(), config.render_timeout())?),
        None => {
            tracing::warn!("RENDER_SERVICE_URL not set; certificate documents are unavailable");
            Arc::new(DisabledRenderer)
        }
    };

    let issuer = Arc::new(Issuer::new(store.clone(), renderer, &config));
    let port = config.port;
    let state = AppState { store, issuer, config: Arc::new(config) };

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
    );

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}
