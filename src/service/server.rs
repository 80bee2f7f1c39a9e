use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use deadpool_postgres::{ManagerConfig, RecyclingMethod, Runtime};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use tokio_postgres::NoTls;

use crate::clock::{self, SharedClock};
use crate::config::Config;
use crate::export::ExportBuilder;
use crate::hold::LegalHoldManager;
use crate::ingest::IngestPipeline;
use crate::log::{LogStore, MemoryLogStore, PostgresLogStore, TransparencyLog};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::service::metrics::{Counters, Metrics};
use crate::service::routes;
use crate::service::state::{AppState, ProcessorState, Schedule};
use crate::signing::Signer;
use crate::storage::{EvidenceStore, EvidenceStoreConfig, MemoryObjectStore, ObjectStore};
use crate::tsa::{HashAlgorithm, HttpTransport, TsaClient, TsaTransport};

/// The collaborators behind the service.
pub struct Backends {
    /// Durable log entries and checkpoints
    pub log: Arc<dyn LogStore>,
    /// Primary object-lock store
    pub objects: Arc<dyn ObjectStore>,
    /// Escrow for held evidence
    pub escrow: Option<Arc<dyn ObjectStore>>,
    /// Time-stamp authority
    pub tsa: Option<Arc<dyn TsaTransport>>,
}

/// Creates and configures the HTTP server with all routes
pub fn create_server(app_state: AppState) -> Router {
    // Fallback handler for unmatched routes
    async fn handle_unmatched() -> (StatusCode, Json<serde_json::Value>) {
        tracing::debug!("Unmatched route accessed");
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "error": "route not found",
                "error_type": "not_found"
            })),
        )
    }

    // Submissions carry the manifest base64-encoded next to the headers.
    let body_limit = app_state
        .store
        .config()
        .max_payload
        .saturating_mul(2)
        .max(64 * 1024);

    Router::new()
        .route("/logs/:origin/root", get(routes::get_root))
        .route("/logs/:origin/size", get(routes::get_size))
        .route("/logs/:origin/entries/:index", get(routes::get_entry))
        .route("/logs/:origin/proof", get(routes::get_inclusion_proof))
        .route("/logs/:origin/consistency", get(routes::get_consistency_proof))
        .route(
            "/logs/:origin/checkpoint",
            get(routes::get_checkpoint).post(routes::post_checkpoint),
        )
        .route("/evidence", post(routes::post_evidence))
        .route("/evidence/:tenant/:asset/:evidence", get(routes::get_evidence))
        .route("/holds", get(routes::list_holds).post(routes::post_hold))
        .route("/holds/:id/release", post(routes::release_hold))
        .route("/exports", post(routes::post_export))
        .route(
            "/exports/:id",
            get(routes::get_export).delete(routes::cancel_export),
        )
        .route("/exports/:id/link", post(routes::post_export_link))
        .route("/downloads/:token", get(routes::download))
        .route("/metrics", get(routes::get_metrics))
        .route("/admin/pause", post(routes::pause_processor))
        .route("/admin/resume", post(routes::resume_processor))
        .route("/admin/stop", post(routes::stop_processor))
        .route("/admin/status", get(routes::get_processor_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
        .fallback(handle_unmatched)
}

/// Wires every component over `backends`. The log and hold state are
/// rebuilt from the log store before this returns.
///
/// # Errors
///
/// Returns an error if a signing seed is malformed or the stored log does
/// not rebuild cleanly.
pub async fn build_state(config: &Config, clock: SharedClock, backends: Backends) -> Result<AppState> {
    let retry = RetryExecutor::new(RetryConfig::default());
    let signer: Arc<dyn Signer> = Arc::new(config.checkpoint_signer()?);
    let export_signer: Arc<dyn Signer> = match config.export_signer()? {
        Some(signer) => Arc::new(signer),
        None => signer.clone(),
    };

    let log = Arc::new(
        TransparencyLog::open(
            config.origin.clone(),
            backends.log,
            signer,
            clock.clone(),
            retry.clone(),
        )
        .await?,
    );
    let store = Arc::new(EvidenceStore::new(
        backends.objects,
        backends.escrow,
        clock.clone(),
        retry,
        EvidenceStoreConfig {
            retention: chrono::Duration::days(config.retention_days),
            max_payload: config.max_payload_bytes,
        },
    ));
    let holds = Arc::new(LegalHoldManager::open(store.clone(), log.clone(), clock.clone())?);

    let tsa = backends.tsa.map(|transport| match &config.tsa {
        Some(tsa) => TsaClient::new(
            transport,
            tsa.hash,
            tsa.policy.clone(),
            RetryExecutor::new(RetryConfig::with_attempts(tsa.attempts)),
        ),
        None => TsaClient::new(transport, HashAlgorithm::Sha256, None, RetryExecutor::default()),
    });
    if tsa.is_none() {
        tracing::warn!("no time-stamp authority configured, evidence will be logged unstamped");
    }

    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        log.clone(),
        tsa,
        Some(holds.clone()),
        clock.clone(),
    ));
    let exports = Arc::new(ExportBuilder::new(
        store.clone(),
        log.clone(),
        export_signer,
        clock.clone(),
        config.max_export_records,
    ));

    let metrics = Arc::new(Metrics::new());
    Counters::set(&metrics.counters.tree_size, log.size());
    Counters::set(
        &metrics.counters.checkpoints,
        log.checkpoints().len() as u64,
    );

    Ok(AppState {
        log,
        store,
        holds,
        exports,
        ingest,
        metrics,
        clock,
        schedule: Schedule {
            checkpoint: config.checkpoint_interval,
            sweep: config.sweep_interval,
        },
        processor_state: Arc::new(AtomicU8::new(ProcessorState::Running as u8)),
    })
}

/// Initialize the application state from configuration: Postgres when
/// `DATABASE_URL` is set, S3 when a bucket is configured, memory otherwise.
///
/// # Errors
///
/// Returns an error if a backend cannot be created or the state cannot be
/// built.
pub async fn initialize_app_state(config: &Config) -> Result<AppState> {
    let clock = clock::system();

    let log: Arc<dyn LogStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database");
            let mut cfg = deadpool_postgres::Config::new();
            cfg.url = Some(url.clone());
            cfg.manager = Some(ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            });
            let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
            Arc::new(PostgresLogStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, the log is kept in memory only");
            Arc::new(MemoryLogStore::new())
        }
    };

    let (objects, escrow) = object_stores(config, &clock).await?;

    let tsa: Option<Arc<dyn TsaTransport>> = match &config.tsa {
        Some(tsa) => {
            tracing::info!(url = %tsa.url, hash = ?tsa.hash, "time-stamp authority configured");
            Some(Arc::new(HttpTransport::new(tsa.url.clone(), tsa.timeout)?))
        }
        None => None,
    };

    build_state(
        config,
        clock,
        Backends {
            log,
            objects,
            escrow,
            tsa,
        },
    )
    .await
}

type ObjectStores = (Arc<dyn ObjectStore>, Option<Arc<dyn ObjectStore>>);

#[cfg(feature = "s3")]
async fn object_stores(config: &Config, clock: &SharedClock) -> Result<ObjectStores> {
    use crate::storage::S3ObjectStore;

    let objects: Arc<dyn ObjectStore> = match &config.s3_bucket {
        Some(bucket) => {
            tracing::info!(bucket = %bucket, "using S3 object-lock store");
            Arc::new(S3ObjectStore::from_env(bucket.clone()).await)
        }
        None => {
            tracing::warn!("CUSTODIAN_S3_BUCKET not set, evidence is kept in memory only");
            Arc::new(MemoryObjectStore::new(clock.clone()))
        }
    };
    let escrow: Option<Arc<dyn ObjectStore>> = match &config.s3_escrow_bucket {
        Some(bucket) => Some(Arc::new(S3ObjectStore::from_env(bucket.clone()).await)),
        None => None,
    };
    Ok((objects, escrow))
}

#[cfg(not(feature = "s3"))]
async fn object_stores(config: &Config, clock: &SharedClock) -> Result<ObjectStores> {
    if config.s3_bucket.is_some() || config.s3_escrow_bucket.is_some() {
        anyhow::bail!("S3 buckets are configured but the binary was built without the `s3` feature");
    }
    tracing::warn!("evidence is kept in memory only");
    Ok((Arc::new(MemoryObjectStore::new(clock.clone())), None))
}

/// Run the HTTP server with the background processor
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the specified address.
pub async fn run_server(app_state: AppState, addr: &SocketAddr) -> Result<()> {
    let process_state = app_state.clone();
    let holds = app_state.holds.clone();

    let processor = tokio::spawn(async move {
        crate::service::processor::run_processor(process_state).await;
    });

    let app = create_server(app_state);

    tracing::info!(address = %addr, "HTTP server listening");
    let server = axum::serve(tokio::net::TcpListener::bind(addr).await?, app);

    // Wait for Ctrl+C, processor, or server to finish
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        result = processor => {
            match result {
                Ok(()) => tracing::info!("Processor completed successfully"),
                Err(e) => tracing::error!(error = ?e, "Processor error"),
            }
        }
        _ = server => {
            tracing::info!("HTTP server shut down");
        }
    }

    let mirrored = holds.wait_for_mirrors().await;
    tracing::info!(copied = mirrored.copied, skipped = mirrored.skipped, "escrow mirrors finished");
    Ok(())
}
