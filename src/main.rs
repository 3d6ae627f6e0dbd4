// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility; see
// `src/lib.rs` for the full list. The binary only pulls together
// construction and shutdown — every behavior lives in the library.
//
use hl_fill_monitor::address_loader::AddressLoader;
use hl_fill_monitor::aggregator::OrderAggregator;
use hl_fill_monitor::batch_writer::BatchWriter;
use hl_fill_monitor::caches::dedup::DedupCache;
use hl_fill_monitor::caches::position::PositionCache;
use hl_fill_monitor::caches::price::PriceCache;
use hl_fill_monitor::caches::symbol_map::SymbolMap;
use hl_fill_monitor::caches::{dedup, symbol_map};
use hl_fill_monitor::cleaner;
use hl_fill_monitor::concurrent::spawn_supervised;
use hl_fill_monitor::config::{self, SharedConfig, SharedOrderAggregationConfig};
use hl_fill_monitor::health;
use hl_fill_monitor::logging;
use hl_fill_monitor::persistence::{Database, MySqlStore};
use hl_fill_monitor::pool::ConnectionPool;
use hl_fill_monitor::processor::{MessageQueue, PipelineHandler, QUEUE_CAPACITY, WORKER_COUNT};
use hl_fill_monitor::publisher::NatsPublisher;
use hl_fill_monitor::schema::{Address, OrderAggregation, PositionSnapshot, Signal, SubscriptionEvent};
use hl_fill_monitor::signal_sink::PersistingSink;

use rustls::crypto::{ring, CryptoProvider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Hard ceiling on graceful shutdown: past this, remaining work is
/// abandoned rather than letting the process hang (spec.md §5).
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation, exactly once and as early as possible.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let initial_config = config::load_config(&config_path)?;
    logging::init_logging(&initial_config.log);

    tracing::info!(path = %config_path.display(), "starting hl-fill-monitor");

    let cancel = CancellationToken::new();
    let shared_config: SharedConfig = Arc::new(RwLock::new(initial_config.clone()));
    let order_aggregation_config: SharedOrderAggregationConfig =
        Arc::new(RwLock::new(initial_config.order_aggregation.clone()));

    // --------------------------------------------------------
    // Storage + bus
    // --------------------------------------------------------
    let db = Database::connect(&initial_config.mysql.dsn, initial_config.mysql.pool_size).await?;
    db.health_check().await?;
    let store = Arc::new(MySqlStore::new(db.clone()));

    let publisher = Arc::new(NatsPublisher::connect(&initial_config.nats.endpoint).await?);

    // --------------------------------------------------------
    // Caches, rehydrated from storage where spec.md §4.6 requires it
    // --------------------------------------------------------
    let symbol_map = Arc::new(SymbolMap::new());
    symbol_map.refresh(store.as_ref()).await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "initial symbol map load failed, starting empty");
    });

    let position_cache = Arc::new(PositionCache::new());
    let price_cache = Arc::new(PriceCache::new());

    let dedup_cache = Arc::new(DedupCache::new(dedup::DEFAULT_TTL));
    match dedup_cache.load_from_db(store.as_ref(), dedup::DEFAULT_TTL).await {
        Ok(n) => tracing::info!(rehydrated = n, "dedup cache rehydrated from signal history"),
        Err(e) => tracing::warn!(error = %e, "dedup cache rehydration failed, starting empty"),
    }

    let status_tracker = Arc::new(hl_fill_monitor::aggregator::StatusTracker::new(
        hl_fill_monitor::aggregator::status_tracker::DEFAULT_TTL,
    ));

    // --------------------------------------------------------
    // Batch writers: one coalescing buffer per persisted row type
    // --------------------------------------------------------
    let signal_writer: Arc<BatchWriter<Signal>> = BatchWriter::new(
        store.clone(),
        initial_config.optimization.batch_size,
        initial_config.optimization.flush_interval(),
    );
    let aggregation_writer: Arc<BatchWriter<OrderAggregation>> = BatchWriter::new(
        store.clone(),
        initial_config.optimization.batch_size,
        initial_config.optimization.flush_interval(),
    );
    let position_writer: Arc<BatchWriter<PositionSnapshot>> = BatchWriter::new(
        store.clone(),
        initial_config.optimization.batch_size,
        initial_config.optimization.flush_interval(),
    );

    let sink = Arc::new(PersistingSink::new(publisher.clone(), signal_writer.clone()));

    let aggregator = Arc::new(OrderAggregator::new(
        status_tracker.clone(),
        position_cache.clone(),
        symbol_map.clone(),
        price_cache.clone(),
        dedup_cache.clone(),
        sink,
        order_aggregation_config.clone(),
    ));

    // --------------------------------------------------------
    // Processing pipeline: bounded queue + worker pool
    // --------------------------------------------------------
    let handler = Arc::new(PipelineHandler::new(aggregator.clone(), position_cache.clone()));
    let (queue, rx) = MessageQueue::new(QUEUE_CAPACITY, handler.clone());
    let worker_handles = hl_fill_monitor::processor::spawn_workers(WORKER_COUNT, rx, handler, cancel.clone());

    // --------------------------------------------------------
    // Connection pool: every inbound frame is awaited through the
    // queue so a full queue genuinely backpressures the socket reader
    // (see `pool::connection::spawn_connection` doc comment).
    // --------------------------------------------------------
    let queue_for_callback = queue.clone();
    let on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> futures_util::future::BoxFuture<'static, ()> + Send + Sync> =
        Arc::new(move |address, event| {
            let queue = queue_for_callback.clone();
            Box::pin(async move { queue.enqueue(address, event).await })
        });

    let pool = ConnectionPool::new(
        initial_config.hl_monitor.hyperliquid_ws_url.clone(),
        initial_config.hl_monitor.max_connections,
        initial_config.hl_monitor.max_subscriptions_per_connection,
        on_event,
        cancel.clone(),
    );

    let address_loader = AddressLoader::new(store.clone(), pool.clone());

    // --------------------------------------------------------
    // Config hot-reload: fans a freshly parsed config out to every live
    // component that `shared_config` alone can't reach, so a reload does
    // more than refresh an otherwise-unread snapshot (spec.md §6).
    // --------------------------------------------------------
    let on_reload: Arc<dyn Fn(&config::AppConfig) + Send + Sync> = {
        let pool = pool.clone();
        let signal_writer = signal_writer.clone();
        let aggregation_writer = aggregation_writer.clone();
        let position_writer = position_writer.clone();
        let order_aggregation_config = order_aggregation_config.clone();
        Arc::new(move |cfg: &config::AppConfig| {
            pool.set_limits(cfg.hl_monitor.max_connections, cfg.hl_monitor.max_subscriptions_per_connection);

            signal_writer.set_batch_size(cfg.optimization.batch_size);
            signal_writer.set_flush_interval(cfg.optimization.flush_interval());
            aggregation_writer.set_batch_size(cfg.optimization.batch_size);
            aggregation_writer.set_flush_interval(cfg.optimization.flush_interval());
            position_writer.set_batch_size(cfg.optimization.batch_size);
            position_writer.set_flush_interval(cfg.optimization.flush_interval());

            let order_aggregation_config = order_aggregation_config.clone();
            let new_agg_cfg = cfg.order_aggregation.clone();
            tokio::spawn(async move {
                *order_aggregation_config.write().await = new_agg_cfg;
            });
        })
    };

    // --------------------------------------------------------
    // Background loops, each under a panic-recovering supervisor
    // (spec.md §7: a crashed subsystem is restarted once, not silently
    // dropped for the rest of the process lifetime).
    // --------------------------------------------------------
    let mut background = Vec::new();

    background.push(spawn_supervised("address_loader", cancel.clone(), {
        let address_loader = address_loader.clone();
        let cancel = cancel.clone();
        let interval = initial_config.hl_monitor.address_reload_interval();
        move || {
            let address_loader = address_loader.clone();
            let cancel = cancel.clone();
            async move { address_loader.run(interval, cancel).await }
        }
    }));
    background.push(spawn_supervised("symbol_map_refresh", cancel.clone(), {
        let symbol_map = symbol_map.clone();
        let store = store.clone();
        let cancel = cancel.clone();
        move || {
            let symbol_map = symbol_map.clone();
            let store = store.clone();
            let cancel = cancel.clone();
            async move { symbol_map::run_refresh_loop(symbol_map, store, Duration::from_secs(60), cancel).await }
        }
    }));
    background.push(spawn_supervised("dedup_sweeper", cancel.clone(), {
        let dedup_cache = dedup_cache.clone();
        let cancel = cancel.clone();
        move || {
            let dedup_cache = dedup_cache.clone();
            let cancel = cancel.clone();
            async move { dedup::run_sweeper(dedup_cache, cancel).await }
        }
    }));
    background.push(spawn_supervised("status_tracker_sweeper", cancel.clone(), {
        let status_tracker = status_tracker.clone();
        let cancel = cancel.clone();
        move || {
            let status_tracker = status_tracker.clone();
            let cancel = cancel.clone();
            async move { hl_fill_monitor::aggregator::status_tracker::run_sweeper(status_tracker, cancel).await }
        }
    }));
    background.push(spawn_supervised("aggregator_timeout_scanner", cancel.clone(), {
        let aggregator = aggregator.clone();
        let cancel = cancel.clone();
        move || {
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            async move { aggregator.run_timeout_scanner(cancel).await }
        }
    }));
    background.push(spawn_supervised("signal_writer_flush", cancel.clone(), {
        let signal_writer = signal_writer.clone();
        let cancel = cancel.clone();
        move || {
            let signal_writer = signal_writer.clone();
            let cancel = cancel.clone();
            async move { signal_writer.run_flush_loop(cancel).await }
        }
    }));
    background.push(spawn_supervised("aggregation_writer_flush", cancel.clone(), {
        let aggregation_writer = aggregation_writer.clone();
        let cancel = cancel.clone();
        move || {
            let aggregation_writer = aggregation_writer.clone();
            let cancel = cancel.clone();
            async move { aggregation_writer.run_flush_loop(cancel).await }
        }
    }));
    background.push(spawn_supervised("position_writer_flush", cancel.clone(), {
        let position_writer = position_writer.clone();
        let cancel = cancel.clone();
        move || {
            let position_writer = position_writer.clone();
            let cancel = cancel.clone();
            async move { position_writer.run_flush_loop(cancel).await }
        }
    }));

    let sweeper: Arc<dyn cleaner::RetentionSweeper> = Arc::new(db.clone());
    background.push(spawn_supervised("retention_cleaner", cancel.clone(), {
        let sweeper = sweeper.clone();
        let cancel = cancel.clone();
        move || {
            let sweeper = sweeper.clone();
            let cancel = cancel.clone();
            async move { cleaner::run(sweeper, cleaner::SWEEP_INTERVAL, cancel).await }
        }
    }));
    background.push(spawn_supervised("config_watcher", cancel.clone(), {
        let config_path = config_path.clone();
        let shared_config = shared_config.clone();
        let cancel = cancel.clone();
        let on_reload = on_reload.clone();
        move || {
            let config_path = config_path.clone();
            let shared_config = shared_config.clone();
            let cancel = cancel.clone();
            let on_reload = on_reload.clone();
            async move {
                config::watch_config(config_path, shared_config, config::CONFIG_POLL_INTERVAL, cancel, on_reload).await
            }
        }
    }));
    background.push(spawn_supervised("health_server", cancel.clone(), {
        let health_cancel = cancel.clone();
        move || {
            let health_cancel = health_cancel.clone();
            async move {
                let listener = match tokio::net::TcpListener::bind("0.0.0.0:9090").await {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!(error = %e, "health server bind failed");
                        return;
                    }
                };
                let server = axum::serve(listener, health::router());
                tokio::select! {
                    result = server => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "health server exited");
                        }
                    }
                    _ = health_cancel.cancelled() => {}
                }
            }
        }
    }));

    tracing::info!("hl-fill-monitor is running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }

    shutdown(cancel, address_loader, pool, worker_handles, signal_writer, aggregation_writer, position_writer, background).await;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn shutdown(
    cancel: CancellationToken,
    address_loader: Arc<AddressLoader>,
    pool: Arc<ConnectionPool>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
    signal_writer: Arc<BatchWriter<Signal>>,
    aggregation_writer: Arc<BatchWriter<OrderAggregation>>,
    position_writer: Arc<BatchWriter<PositionSnapshot>>,
    background: Vec<tokio::task::JoinHandle<()>>,
) {
    let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        cancel.cancel();
        drop(address_loader);

        // stop accepting new work, then close every socket
        pool.shutdown();

        // wait for queued events to drain before flushing buffers, so
        // a flush doesn't race an in-flight aggregation mutation
        hl_fill_monitor::processor::drain(worker_handles).await;

        signal_writer.flush().await;
        aggregation_writer.flush().await;
        position_writer.flush().await;

        futures_util::future::join_all(background).await;
    })
    .await;

    tracing::info!("shutdown complete");
}
