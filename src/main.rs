use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roombook::auth::SharedSecret;
use roombook::clock::SystemClock;
use roombook::config::Config;
use roombook::engine::Engine;
use roombook::notify::EventHub;
use roombook::{sweeper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("roombook=info")))
        .init();

    let config = Config::from_env()?;
    roombook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::open(
        &config.journal_path(),
        config.policy.clone(),
        Arc::new(SystemClock),
        Arc::new(EventHub::new()),
    )?);

    tokio::spawn(sweeper::run_sweeper(
        engine.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    ));
    tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let secret = SharedSecret::new(config.secret.clone());
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roombook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  rooms: {}",
        if config.policy.rooms.is_empty() {
            "any".to_string()
        } else {
            config.policy.rooms.len().to_string()
        }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}); ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(roombook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(roombook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roombook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let secret = secret.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, secret).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roombook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("roombook stopped");
    Ok(())
}
