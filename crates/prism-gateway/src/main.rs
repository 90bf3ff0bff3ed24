use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use prism_analysis::AnalysisWorker;
use prism_credentials::CredentialStore;
use prism_storage::{AnalysisStore, RequestStore, WritePipeline};

use prism_gateway::app;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism_gateway=info,tower_http=info".into()),
        )
        .init();

    // Config: explicit arg > PRISM_CONFIG env > ./prism.toml.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PRISM_CONFIG").ok());
    let config = match prism_core::PrismConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e}");
            return ExitCode::from(1);
        }
    };

    // Credential store: startup scan plus filesystem watch.
    let credentials = Arc::new(CredentialStore::new(
        &config.credentials.credentials_dir,
        config.credentials.oauth_refresh_lead_secs,
    ));
    if let Err(e) = credentials.scan() {
        error!(
            dir = %config.credentials.credentials_dir,
            "credential directory scan failed: {e}"
        );
        return ExitCode::from(1);
    }
    if let Err(e) = credentials.spawn_watcher() {
        warn!("credential watcher unavailable, relying on mtime checks: {e}");
    }

    // Storage: one connection per subsystem, shared schema.
    let open_and_init = |label: &str| match prism_storage::open(&config.database.database_url) {
        Ok(conn) => {
            if let Err(e) = prism_storage::init_db(&conn) {
                error!("schema init failed ({label}): {e}");
                None
            } else {
                Some(conn)
            }
        }
        Err(e) => {
            error!("database open failed ({label}): {e}");
            None
        }
    };

    let (Some(writer_conn), Some(reader_conn), Some(analysis_conn)) = (
        open_and_init("writer"),
        open_and_init("reader"),
        open_and_init("analyses"),
    ) else {
        return ExitCode::from(1);
    };

    let (pipeline_stop_tx, pipeline_stop_rx) = watch::channel(false);
    let (pipeline, writer_handle) = if config.database.storage_enabled {
        let (pipeline, handle) =
            WritePipeline::spawn(writer_conn, &config.pipeline, pipeline_stop_rx);
        (pipeline, Some(handle))
    } else {
        info!("storage disabled; proxying without persistence");
        (WritePipeline::disabled(), None)
    };

    let requests = Arc::new(RequestStore::new(
        reader_conn,
        config.database.slow_query_threshold_ms,
    ));
    let analyses = Arc::new(AnalysisStore::new(analysis_conn));

    // Background analysis worker.
    let (worker_stop_tx, worker_stop_rx) = watch::channel(false);
    if config.analysis.ai_worker_enabled && config.database.storage_enabled {
        match AnalysisWorker::new(
            Arc::clone(&analyses),
            Arc::clone(&requests),
            config.analysis.clone(),
        ) {
            Ok(worker) => {
                tokio::spawn(Arc::new(worker).run(worker_stop_rx));
            }
            Err(e) => {
                error!("analysis worker init failed: {e}");
                return ExitCode::from(1);
            }
        }
    }

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let drain_ms = config.server.shutdown_drain_ms;
    let flush_ms = config.pipeline.shutdown_flush_timeout_ms;

    let state = Arc::new(app::AppState::new(
        config,
        credentials,
        pipeline,
        requests,
        analyses,
    ));
    let router = app::build_router(state);

    let addr: SocketAddr = match format!("{bind}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid bind address {bind}:{port}: {e}");
            return ExitCode::from(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind failed on {addr}: {e}");
            return ExitCode::from(1);
        }
    };
    info!("prism gateway listening on {addr}");

    // Serve until a signal arrives, then drain in-flight requests with a
    // bound, flush the write pipeline, and stop the worker.
    let (serve_stop_tx, mut serve_stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = serve_stop_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received; draining");
    let _ = serve_stop_tx.send(true);

    let mut code = ExitCode::SUCCESS;
    match tokio::time::timeout(std::time::Duration::from_millis(drain_ms), server).await {
        Ok(Ok(Ok(()))) => info!("in-flight requests drained"),
        Ok(Ok(Err(e))) => {
            error!("server error during drain: {e}");
            code = ExitCode::from(2);
        }
        Ok(Err(e)) => {
            error!("server task panicked: {e}");
            code = ExitCode::from(2);
        }
        Err(_) => {
            warn!("drain timeout; closing with requests in flight");
            code = ExitCode::from(2);
        }
    }

    let _ = worker_stop_tx.send(true);
    let _ = pipeline_stop_tx.send(true);
    if let Some(handle) = writer_handle {
        // The writer's own drain is bounded; give it that plus slack.
        match tokio::time::timeout(
            std::time::Duration::from_millis(flush_ms + 5_000),
            handle,
        )
        .await
        {
            Ok(Ok(())) => info!("write pipeline flushed"),
            _ => {
                error!("write pipeline failed to flush in time");
                code = ExitCode::from(2);
            }
        }
    }

    code
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
