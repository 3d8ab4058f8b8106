use object_lifetime::api::handlers::router;
use object_lifetime::api::session::DriverSession;
use object_lifetime::{Cluster, ClusterConfig, TaskHandlerRegistry, Value};
use std::net::SocketAddr;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--config <file.json>] [--nodes <n>] [--workers <n>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:6000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:6000 --nodes 3 --workers 4",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut config_path: Option<String> = None;
    let mut nodes: Option<usize> = None;
    let mut workers: Option<usize> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse()?);
                i += 2;
            }
            ("--config", Some(value)) => {
                config_path = Some(value.clone());
                i += 2;
            }
            ("--nodes", Some(value)) => {
                nodes = Some(value.parse()?);
                i += 2;
            }
            ("--workers", Some(value)) => {
                workers = Some(value.parse()?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.ok_or_else(|| anyhow::anyhow!("--bind is required"))?;

    // 1. Configuration: file (or defaults), then environment, then flags
    let mut config = match &config_path {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    }
    .with_env_overrides()?;
    if let Some(nodes) = nodes {
        config.num_nodes = nodes;
    }
    if let Some(workers) = workers {
        config.num_workers = workers;
    }
    config.validate()?;

    tracing::info!("Starting object lifetime node on {}", bind_addr);
    tracing::info!("Config: {:?}", config);

    // 2. Task handlers:
    let registry = TaskHandlerRegistry::new();

    registry.register("echo", |ctx| async move {
        Ok(ctx.args.into_iter().next().unwrap_or(Value::Null))
    });

    registry.register("len", |ctx| async move {
        let len = match ctx.arg(0) {
            Some(Value::Str(s)) => s.len(),
            Some(Value::Bytes(bytes)) => bytes.len(),
            Some(Value::List(items)) => items.len(),
            Some(Value::Map(entries)) => entries.len(),
            _ => 0,
        };
        Ok(Value::Int(len as i64))
    });

    registry.register("sleep_ms", |ctx| async move {
        let ms = ctx.arg(0).and_then(Value::as_int).unwrap_or(1_000).max(0) as u64;
        tracing::info!("Task {} sleeping {}ms", ctx.task_id, ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Value::Null)
    });

    // Puts a buffer owned by the executor and returns a ref to it
    registry.register("put_bytes", |ctx| async move {
        let len = ctx.arg(0).and_then(Value::as_int).unwrap_or(1024).max(0) as usize;
        let inner = ctx.put(Value::Bytes(vec![0; len])).await?;
        Ok(Value::list([Value::Ref(inner)]))
    });

    // 3. Cluster and the driver the HTTP clients act through:
    let cluster = Cluster::start(config, registry).await?;
    let driver = cluster.driver();
    let session = DriverSession::new(cluster.clone(), driver);

    // 4. HTTP Router:
    let app = router(session.clone());

    // 5. Spawn stats reporter:
    let stats_cluster = cluster.clone();
    let stats_session = session.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let stats = stats_cluster.stats();
            let alive = stats.workers.iter().filter(|worker| worker.alive).count();
            tracing::info!(
                "Cluster stats: {} node(s), {}/{} workers alive, {} object(s) held over HTTP",
                stats.nodes.len(),
                alive,
                stats.workers.len(),
                stats_session.held()
            );
            for node in stats.nodes {
                tracing::info!(
                    "  - {} used={}/{} objects={} evictions={}{}",
                    node.node,
                    node.used_bytes,
                    node.capacity_bytes,
                    node.objects,
                    node.evictions,
                    if node.failed { " (failed)" } else { "" }
                );
            }
        }
    });

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cluster.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
}

