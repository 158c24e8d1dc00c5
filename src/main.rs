// =============================================================================
// Signal-Driven Trading Core — Process Entry Point
// =============================================================================
//
// Boots the hybrid store, reconstructs the in-memory position map from the
// durable mirror, reconciles it against every user's broker (§4.8 startup
// reconciliation), then spawns one Position Monitor loop and one Auto-Trader
// task per registered user. All of it is cancelled cleanly on Ctrl+C, with
// the durable mirror flushed before exit (§5 "Cancellation").
// =============================================================================

mod alert;
mod autotrader;
mod binance;
mod broker;
mod calendar;
mod candles;
mod config;
mod error;
mod indicators;
mod models;
mod monitor;
mod portfolio;
mod reconcile;
mod regime;
mod risk;
mod signals;
mod store;
mod supervisor;
mod types;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert::TracingAlertSink;
use crate::autotrader::AutoTrader;
use crate::calendar::NoOpCalendar;
use crate::config::Config;
use crate::monitor::{PositionMonitor, StaticBrokerRegistry};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::supervisor::{build_users_and_brokers, load_users_file};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("signal-trader-core starting up");

    // ── 1. Config + users ────────────────────────────────────────────────
    let config_path = std::env::var("CORE_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    let users_path = std::env::var("CORE_USERS_PATH").unwrap_or_else(|_| "users.json".to_string());
    let user_rows = load_users_file(&users_path)?;
    if user_rows.is_empty() {
        warn!(path = %users_path, "no users configured — engine will idle with no Auto-Trader/Monitor work");
    }
    let (users, brokers) = build_users_and_brokers(user_rows);
    info!(count = users.len(), "loaded user roster");

    // ── 2. Durable store ──────────────────────────────────────────────────
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://trading_core.db".to_string());
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&database_url).await?);
    info!(database_url = %database_url, "durable store connected and migrated");

    // ── 3. Shared collaborators ───────────────────────────────────────────
    let broker_registry = Arc::new(StaticBrokerRegistry::new(brokers.clone()));
    let alerts = Arc::new(TracingAlertSink);
    let calendar = Arc::new(NoOpCalendar);

    // ── 4. Position Monitor: load mirror, then reconcile per user ────────
    let (monitor, monitor_tx) = PositionMonitor::new(store.clone(), broker_registry, alerts.clone(), config.clone());
    monitor.load_from_store().await?;

    for user in &users {
        let Some(broker) = brokers.get(&user.id) else { continue };
        let now = Utc::now();

        match reconcile::ingest_unmonitored_positions(
            broker.as_ref(),
            store.as_ref(),
            user.id,
            user.trading_mode,
            user.settings.stop_loss_pct,
            user.settings.take_profit_pct,
            &config,
        )
        .await
        {
            Ok(ingested) => {
                for position in ingested {
                    monitor.ingest(position);
                }
            }
            Err(e) => warn!(user_id = %user.id, error = %e, "startup ingestion of unmonitored positions failed"),
        }

        let broker_for_price = broker.clone();
        match reconcile::ghost_cleanup(store.as_ref(), broker.as_ref(), user.id, config.ghost_grace_minutes, now, |symbol| {
            let broker_for_price = broker_for_price.clone();
            async move { broker_for_price.get_market_price(&symbol).await.unwrap_or(0.0) }
        })
        .await
        {
            Ok(trades) => {
                if !trades.is_empty() {
                    info!(user_id = %user.id, count = trades.len(), "ghost positions cleaned up at startup");
                }
                for trade in trades {
                    // `ghost_cleanup` only closed this position in the durable
                    // store; the in-memory map (just rebuilt by
                    // `load_from_store`) still has it OPEN. Drop it here so
                    // the monitor never re-evaluates or checkpoints a ghost
                    // back into existence (§4.8).
                    monitor.forget_closed(trade.position_id);
                }
            }
            Err(e) => warn!(user_id = %user.id, error = %e, "startup ghost cleanup failed"),
        }
    }

    // ── 5. Spawn Monitor + one Auto-Trader per user ───────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_handle = {
        let monitor = monitor.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { monitor.run(shutdown_rx).await })
    };

    let mut trader_handles = Vec::with_capacity(users.len());
    for user in users {
        let Some(broker) = brokers.get(&user.id).cloned() else {
            warn!(user_id = %user.id, "no broker configured for user, skipping");
            continue;
        };
        let trader = Arc::new(AutoTrader::new(
            user,
            broker,
            store.clone(),
            calendar.clone(),
            config.clone(),
            monitor.clone(),
            monitor_tx.clone(),
        ));
        let shutdown_rx = shutdown_rx.clone();
        trader_handles.push(tokio::spawn(async move { trader.run(shutdown_rx).await }));
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    if let Err(e) = monitor_handle.await {
        error!(error = %e, "monitor task panicked during shutdown");
    }
    for handle in trader_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "auto-trader task panicked during shutdown");
        }
    }

    info!("signal-trader-core shut down complete");
    Ok(())
}
