use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use souk_core::listings::{ListingProvider, RemoteListings};
use souk_core::notify::{NotificationSink, WebhookNotifier};
use souk_core::{AppConfig, AppState};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    if let Some(cli::Command::Token { user_id, expiry }) = args.command {
        let expiry = expiry.unwrap_or(config.auth.jwt_expiry_seconds);
        let token = souk_core::auth::create_token(user_id, &config.auth.jwt_secret, expiry)?;
        println!("{token}");
        return Ok(());
    }

    ensure_sqlite_dir(&config.database.url);
    let engine = souk_db::detect_database_engine(&config.database.url)?;
    let db = souk_db::create_pool(&config.database.url, config.database.max_connections).await?;
    souk_db::run_migrations(&db, engine).await?;

    let listings = match config.listings.source {
        config::ListingSource::Database => ListingProvider::Database(db.clone()),
        config::ListingSource::Remote => {
            let base_url = config
                .listings
                .base_url
                .as_deref()
                .context("listings.base_url is required for remote listings")?;
            ListingProvider::Remote(RemoteListings::new(
                base_url,
                Duration::from_secs(config.listings.cache_ttl_seconds),
            )?)
        }
    };
    let notifier = match &config.notifications.webhook_url {
        Some(url) => NotificationSink::Webhook(WebhookNotifier::new(url)?),
        None => NotificationSink::Log,
    };

    let state = AppState::new(
        db,
        AppConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            jwt_expiry_seconds: config.auth.jwt_expiry_seconds,
            gateway: config.gateway.settings(),
        },
        listings,
        notifier,
    );

    let limiter = state.send_limiter.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => limiter.prune(),
                () = shutdown.cancelled() => break,
            }
        }
    });

    let app = souk_api::build_router()
        .merge(souk_ws::gateway_router())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind = %config.server.bind_address,
        engine = engine.as_str(),
        listings = ?config.listings.source,
        webhook = config.notifications.webhook_url.is_some(),
        "souk server listening"
    );

    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down (ctrl-c)...");
            }
            () = shutdown.cancelled() => {}
        }
        // Closes every gateway session with 1001.
        shutdown.cancel();
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("souk server stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("souk=info,tower_http=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_sqlite_dir(url: &str) {
    let Some(db_path) = url
        .strip_prefix("sqlite://")
        .and_then(|s| s.split('?').next())
    else {
        return;
    };
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
            }
        }
    }
}
