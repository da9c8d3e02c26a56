//! Binary entrypoint for the bento control plane.
use std::sync::Arc;
use std::time::Duration;

use bento_control_plane::{
    build_router, AppState, BentoVersionService,
    cluster::{install_crypto_provider, ClusterResolver},
    config::Settings,
    db::init_db,
    engine::KubeConnector,
    storage::S3Gateway,
    store::PgVersionStore,
    telemetry::init_tracing,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::info;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_crypto_provider();
    let settings = Settings::from_env();
    init_tracing(settings.log_format)?;
    let pool = init_db(&settings.database_url).await?;
    let engine = BentoVersionService::new(
        Arc::new(PgVersionStore::new(pool)),
        Arc::new(S3Gateway),
        Arc::new(KubeConnector::new(ClusterResolver::new(settings.kube_limits))),
        settings.build.clone(),
    );
    let app = build_router(AppState { engine })
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));
    info!(addr=%settings.listen_addr, namespace=%settings.build.namespace, "control-plane listening");
    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { tracing::warn!(error=%e, "shutdown.signal_handler_failed"); }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
