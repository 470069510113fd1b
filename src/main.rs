use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};

use stateset_checkout as app;
use stateset_checkout::{
    cache::CacheFactory,
    catalog::DbCatalog,
    gateway::paystack::PaystackGateway,
    notifications::LogNotifier,
    rate_limiter::{RateLimitBackend, RateLimitConfig, RateLimiter},
    services::sweeper::{AbandonmentSweeper, SweeperSchedule},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = app::config::load_config().context("failed to load configuration")?;
    app::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db_pool = app::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        app::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = app::events::EventSender::new(event_tx);
    tokio::spawn(app::events::process_events(event_rx));

    if cfg.gateway_secret_key.is_none() {
        warn!("APP__GATEWAY_SECRET_KEY not set; checkout and webhooks will fail");
    }
    let gateway = Arc::new(
        PaystackGateway::new(
            cfg.gateway_base_url.clone(),
            cfg.gateway_secret_key.clone().unwrap_or_default(),
            cfg.gateway_timeout(),
        )
        .context("failed to build gateway client")?,
    );
    let cache = CacheFactory::create_cache(cfg.redis_url.as_deref());
    let catalog = Arc::new(DbCatalog::new(db.clone(), cache.clone(), cfg.product_cache_ttl()));

    let rl_cfg = RateLimitConfig {
        requests_per_window: cfg.checkout_rate_limit_per_minute,
        window_duration: Duration::from_secs(60),
    };
    let rl_backend = match cfg.redis_url.as_deref().map(redis::Client::open) {
        Some(Ok(client)) => RateLimitBackend::Redis {
            client: Arc::new(client),
            namespace: "checkout".to_string(),
        },
        Some(Err(e)) => {
            warn!(error = %e, "invalid Redis URL, rate limiting in memory");
            RateLimitBackend::InMemory
        }
        None => RateLimitBackend::InMemory,
    };
    let rate_limiter = Arc::new(RateLimiter::new(rl_cfg, rl_backend));

    let state = app::AppState::new(
        db.clone(),
        cfg.clone(),
        gateway,
        catalog,
        cache,
        rate_limiter,
        event_sender,
    )
    .context("failed to build application state")?;

    // Background jobs share one shutdown flag.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = vec![app::events::outbox::spawn_worker(
        db.clone(),
        Arc::new(LogNotifier),
        Duration::from_millis(cfg.outbox_poll_interval_ms),
        shutdown_rx.clone(),
    )];
    background.extend(
        AbandonmentSweeper::new(state.ledger.clone())
            .spawn(SweeperSchedule::from(&cfg), shutdown_rx),
    );

    let router = app::app_router(state);

    let host: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host {}", cfg.host))?;
    let addr = SocketAddr::from((host, cfg.port));
    info!("stateset-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, waiting for background jobs");
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background job panicked");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
