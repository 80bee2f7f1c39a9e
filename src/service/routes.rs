use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::export::{DownloadLink, ExportScope, ExportState, ExportStatus};
use crate::hold::{LegalHold, PlaceHold};
use crate::ingest::{IngestReceipt, TimestampStatus};
use crate::log::Checkpoint;
use crate::service::metrics::Counters;
use crate::service::responses::{
    ApiError, ApiResponse, ApiResult, ConsistencyProofResponse, EntryResponse, EvidenceResponse,
    InclusionProofResponse, MetricsResponse, ProcessorStatusResponse, RootResponse, SizeResponse,
};
use crate::service::state::{AppState, ProcessorState};
use crate::storage::{EvidenceKey, EvidenceSubmission};
use crate::tsa::TstInfo;

/// Query parameters for GET `/logs/{origin}/proof`
#[derive(Debug, Deserialize, Serialize)]
pub struct InclusionQuery {
    /// Leaf index to prove
    pub index: u64,
    /// Tree size to prove against; the current size when absent
    pub tree_size: Option<u64>,
}

/// Query parameters for GET `/logs/{origin}/consistency`
#[derive(Debug, Deserialize, Serialize)]
pub struct ConsistencyQuery {
    /// The old tree size
    pub old_size: u64,
    /// The new tree size; the current size when absent
    pub new_size: Option<u64>,
}

/// Body of POST /evidence
#[derive(Debug, Deserialize, Serialize)]
pub struct IngestRequest {
    /// The submission
    #[serde(flatten)]
    pub submission: EvidenceSubmission,
    /// Write under legal hold
    #[serde(default)]
    pub legal_hold: bool,
}

/// Body of POST `/holds/{id}/release`
#[derive(Debug, Deserialize, Serialize)]
pub struct ReleaseRequest {
    /// Why the hold ends
    pub reason: String,
    /// Who ends it
    pub released_by: String,
}

/// Query parameters for GET /holds
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct HoldsQuery {
    /// Include released and expired holds
    #[serde(default)]
    pub include_ended: bool,
}

/// Body of POST `/exports/{id}/link`
#[derive(Debug, Deserialize, Serialize)]
pub struct LinkRequest {
    /// Lifetime of the link in seconds
    #[serde(default = "default_link_ttl")]
    pub ttl_secs: i64,
}

const fn default_link_ttl() -> i64 {
    3600
}

fn check_origin(state: &AppState, origin: &str) -> Result<()> {
    if origin == state.log.origin() {
        Ok(())
    } else {
        Err(Error::not_found(format!("log '{origin}'")))
    }
}

/// GET `/logs/{origin}/root`
pub async fn get_root(State(state): State<AppState>, Path(origin): Path<String>) -> ApiResult<RootResponse> {
    check_origin(&state, &origin)?;
    let tree_size = state.log.size();
    Ok(ApiResponse::success(RootResponse {
        root_hash: state.log.root_at(tree_size)?,
        tree_size,
        origin,
    }))
}

/// GET `/logs/{origin}/size`
pub async fn get_size(State(state): State<AppState>, Path(origin): Path<String>) -> ApiResult<SizeResponse> {
    check_origin(&state, &origin)?;
    Ok(ApiResponse::success(SizeResponse {
        size: state.log.size(),
        origin,
    }))
}

/// GET `/logs/{origin}/entries/{index}`
pub async fn get_entry(
    State(state): State<AppState>,
    Path((origin, index)): Path<(String, u64)>,
) -> ApiResult<EntryResponse> {
    check_origin(&state, &origin)?;
    let entry = state.log.get_entry(index)?;
    Ok(ApiResponse::success(EntryResponse {
        leaf_hash: entry.leaf_hash()?,
        leaf_index: index,
        entry,
        origin,
    }))
}

/// GET `/logs/{origin}/proof`
pub async fn get_inclusion_proof(
    State(state): State<AppState>,
    Path(origin): Path<String>,
    Query(query): Query<InclusionQuery>,
) -> ApiResult<InclusionProofResponse> {
    let start = Instant::now();
    let result = inclusion_proof(&state, origin, &query);
    state.metrics.http.inclusion.record(start.elapsed(), result.is_ok());
    Ok(ApiResponse::success(result?))
}

fn inclusion_proof(state: &AppState, origin: String, query: &InclusionQuery) -> Result<InclusionProofResponse> {
    check_origin(state, &origin)?;
    let proof = match query.tree_size {
        Some(tree_size) => state.log.inclusion_proof_at(query.index, tree_size)?,
        None => state.log.inclusion_proof(query.index)?,
    };
    Ok(InclusionProofResponse {
        root_hash: state.log.root_at(proof.tree_size)?,
        proof,
        origin,
    })
}

/// GET `/logs/{origin}/consistency`
pub async fn get_consistency_proof(
    State(state): State<AppState>,
    Path(origin): Path<String>,
    Query(query): Query<ConsistencyQuery>,
) -> ApiResult<ConsistencyProofResponse> {
    let start = Instant::now();
    let result = consistency_proof(&state, origin, &query);
    state.metrics.http.consistency.record(start.elapsed(), result.is_ok());
    Ok(ApiResponse::success(result?))
}

fn consistency_proof(
    state: &AppState,
    origin: String,
    query: &ConsistencyQuery,
) -> Result<ConsistencyProofResponse> {
    check_origin(state, &origin)?;
    let new_size = query.new_size.unwrap_or_else(|| state.log.size());
    let proof = state.log.consistency_proof(query.old_size, new_size)?;
    Ok(ConsistencyProofResponse {
        old_root: state.log.root_at(proof.old_size)?,
        new_root: state.log.root_at(proof.new_size)?,
        proof,
        origin,
    })
}

/// GET `/logs/{origin}/checkpoint`
pub async fn get_checkpoint(State(state): State<AppState>, Path(origin): Path<String>) -> ApiResult<Checkpoint> {
    check_origin(&state, &origin)?;
    let checkpoint = state
        .log
        .latest_checkpoint()
        .ok_or_else(|| Error::not_found(format!("checkpoint of '{origin}'")))?;
    Ok(ApiResponse::success(checkpoint))
}

/// POST `/logs/{origin}/checkpoint`
pub async fn post_checkpoint(State(state): State<AppState>, Path(origin): Path<String>) -> ApiResult<Checkpoint> {
    check_origin(&state, &origin)?;
    let checkpoint = state.log.checkpoint().await?;
    Counters::add(&state.metrics.counters.checkpoints, 1);
    Counters::set(&state.metrics.counters.tree_size, checkpoint.tree_size);
    Ok(ApiResponse::success(checkpoint))
}

/// POST /evidence
pub async fn post_evidence(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<IngestReceipt> {
    let receipt = state.ingest.ingest(&request.submission, request.legal_hold).await?;

    let counters = &state.metrics.counters;
    Counters::add(&counters.ingested, 1);
    if receipt.duplicate {
        Counters::add(&counters.duplicates, 1);
    }
    match receipt.timestamp {
        TimestampStatus::Granted => Counters::add(&counters.tsa_granted, 1),
        TimestampStatus::Pending => Counters::add(&counters.tsa_deferred, 1),
        TimestampStatus::Disabled => {}
    }
    Counters::set(&counters.tree_size, state.log.size());
    Counters::set(&counters.gap_queue, state.ingest.pending() as u64);

    Ok(ApiResponse::success(receipt))
}

/// GET `/evidence/{tenant}/{asset}/{evidence}`
pub async fn get_evidence(
    State(state): State<AppState>,
    Path((tenant, asset, evidence)): Path<(String, String, String)>,
) -> ApiResult<EvidenceResponse> {
    let key = EvidenceKey::new(tenant, asset, evidence)?;
    let object_key = key.record_key();
    let record = state.store.record(&key).await?;
    let versions = state.store.versions(&object_key).await?;

    let leaf_index = state.log.find_evidence(&object_key);
    let inclusion_proof = leaf_index.map(|i| state.log.inclusion_proof(i)).transpose()?;
    let timestamp = state
        .store
        .timestamp_token(&key)
        .await?
        .map(|token| TstInfo::from_token(&token))
        .transpose()
        .map_err(|e| Error::Serialization(format!("stored time-stamp token: {e}")))?;

    Ok(ApiResponse::success(EvidenceResponse {
        under_hold: state.holds.covers(&key).await,
        object_key,
        record,
        versions,
        leaf_index,
        inclusion_proof,
        timestamp,
    }))
}

/// POST /holds
pub async fn post_hold(State(state): State<AppState>, Json(request): Json<PlaceHold>) -> ApiResult<LegalHold> {
    let hold = state.holds.place(request).await?;
    Counters::add(&state.metrics.counters.holds_placed, 1);
    Ok(ApiResponse::success(hold))
}

/// POST `/holds/{id}/release`
pub async fn release_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<String>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<LegalHold> {
    let hold = state
        .holds
        .release(&hold_id, &request.reason, &request.released_by)
        .await?;
    Counters::add(&state.metrics.counters.holds_ended, 1);
    Ok(ApiResponse::success(hold))
}

/// GET /holds
pub async fn list_holds(State(state): State<AppState>, Query(query): Query<HoldsQuery>) -> ApiResult<Vec<LegalHold>> {
    Ok(ApiResponse::success(state.holds.list(query.include_ended).await))
}

/// POST /exports
pub async fn post_export(State(state): State<AppState>, Json(scope): Json<ExportScope>) -> ApiResult<ExportStatus> {
    Ok(ApiResponse::success(state.exports.build(scope).await?))
}

/// GET `/exports/{id}`
pub async fn get_export(State(state): State<AppState>, Path(export_id): Path<String>) -> ApiResult<ExportStatus> {
    Ok(ApiResponse::success(state.exports.status(&export_id)?))
}

/// DELETE `/exports/{id}`
pub async fn cancel_export(State(state): State<AppState>, Path(export_id): Path<String>) -> ApiResult<ExportStatus> {
    Ok(ApiResponse::success(state.exports.cancel(&export_id)?))
}

/// POST `/exports/{id}/link`
pub async fn post_export_link(
    State(state): State<AppState>,
    Path(export_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> ApiResult<DownloadLink> {
    if request.ttl_secs <= 0 {
        return Err(Error::invalid("ttl_secs must be positive").into());
    }
    let link = state
        .exports
        .issue_download_link(&export_id, chrono::Duration::seconds(request.ttl_secs))?;
    Ok(ApiResponse::success(link))
}

/// GET `/downloads/{token}`: the raw archive, once.
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let (export_id, archive) = state.exports.redeem(&token)?;
    tracing::info!(export_id = %export_id, bytes = archive.len(), "export downloaded");
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-tar".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{export_id}.tar\""),
            ),
        ],
        archive.as_ref().clone(),
    ))
}

/// GET /metrics
pub async fn get_metrics(State(state): State<AppState>) -> ApiResult<MetricsResponse> {
    let counters = &state.metrics.counters;
    let ready = state
        .exports
        .list()
        .iter()
        .filter(|status| status.state == ExportState::Ready)
        .count();
    Counters::set(&counters.exports_built, ready as u64);
    Counters::set(&counters.gap_queue, state.ingest.pending() as u64);
    Counters::set(&counters.tree_size, state.log.size());
    Counters::set(&counters.appends, state.log.appended());

    Ok(ApiResponse::success(MetricsResponse {
        origin: state.log.origin().to_string(),
        counters: counters.snapshot(),
        cycle: state.metrics.cycle.read().clone(),
        http: state.metrics.http.snapshot(),
        review: state.metrics.review.read().clone(),
        generated_at: state.clock.now(),
    }))
}

/// POST /admin/pause
pub async fn pause_processor(State(state): State<AppState>) -> ApiResult<ProcessorStatusResponse> {
    set_processor(&state, ProcessorState::Paused)
}

/// POST /admin/resume
pub async fn resume_processor(State(state): State<AppState>) -> ApiResult<ProcessorStatusResponse> {
    set_processor(&state, ProcessorState::Running)
}

/// POST /admin/stop
pub async fn stop_processor(State(state): State<AppState>) -> ApiResult<ProcessorStatusResponse> {
    set_processor(&state, ProcessorState::Stopping)
}

fn set_processor(state: &AppState, target: ProcessorState) -> ApiResult<ProcessorStatusResponse> {
    if state.processor() == ProcessorState::Stopping {
        return Err(Error::invalid("processor is stopping").into());
    }
    state.set_processor(target);
    tracing::info!(state = target.as_str(), "processor state changed");
    processor_status(state)
}

/// GET /admin/status
pub async fn get_processor_status(State(state): State<AppState>) -> ApiResult<ProcessorStatusResponse> {
    processor_status(&state)
}

#[allow(clippy::unnecessary_wraps)]
fn processor_status(state: &AppState) -> ApiResult<ProcessorStatusResponse> {
    Ok(ApiResponse::success(ProcessorStatusResponse {
        processor: state.processor().as_str().to_string(),
    }))
}
