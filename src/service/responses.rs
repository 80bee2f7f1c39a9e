use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::hold::ReviewReport;
use crate::log::LogEntry;
use crate::storage::{EvidenceRecord, ObjectMeta};
use crate::tsa::TstInfo;
use crate::{ConsistencyProof, Hash, InclusionProof};

use super::metrics::{CountersSnapshot, CycleMetrics, HttpMetricsSnapshot};

/// Unified API response wrapper
///
/// All endpoints return either Success(data) or `Error(error_info)`
/// This ensures consistent JSON structure across the API
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse<T> {
    /// Successful response with data
    #[serde(rename = "ok")]
    Success(T),
    /// Error response with message and optional error type
    Error {
        /// Human-readable error message
        error: String,
        /// Machine-readable error type for client handling
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<ErrorKind>,
    },
}

impl<T: Serialize> ApiResponse<T> {
    /// Creates a successful response
    pub const fn success(data: T) -> Self {
        Self::Success(data)
    }

    /// Creates an error response carrying the error class
    pub fn error(error: &Error) -> Self {
        Self::Error {
            error: error.to_string(),
            error_type: Some(error.kind()),
        }
    }
}

/// Convert `ApiResponse` to Axum response with appropriate status code
impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiResponse::Success(_) => StatusCode::OK,
            ApiResponse::Error {
                error_type: Some(kind),
                ..
            } => status_for(*kind),
            ApiResponse::Error { .. } => StatusCode::BAD_REQUEST,
        };

        (status, Json(self)).into_response()
    }
}

/// HTTP status for each error class. The four write-path classes map to
/// distinct codes so clients can tell which ones are worth retrying.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Signature => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ConsistencyViolation => StatusCode::CONFLICT,
        ErrorKind::TsaRejected => StatusCode::BAD_GATEWAY,
        ErrorKind::TsaUnavailable | ErrorKind::Storage => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Serialization => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error; renders as the error envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self.0, kind = %self.0.kind(), "request failed");
        ApiResponse::<()>::error(&self.0).into_response()
    }
}

/// Result type of every JSON handler
pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

/// Response for GET `/logs/{origin}/root`
#[derive(Debug, Serialize, Deserialize)]
pub struct RootResponse {
    /// Log origin
    pub origin: String,
    /// Base64-encoded root hash
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// Number of leaves in the tree
    pub tree_size: u64,
}

/// Response for GET `/logs/{origin}/size`
#[derive(Debug, Serialize, Deserialize)]
pub struct SizeResponse {
    /// Log origin
    pub origin: String,
    /// Number of entries in the log
    pub size: u64,
}

/// Response for GET `/logs/{origin}/entries/{index}`
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    /// Log origin
    pub origin: String,
    /// Leaf index
    pub leaf_index: u64,
    /// Leaf hash
    #[serde(with = "crate::hash_format")]
    pub leaf_hash: Hash,
    /// The entry
    pub entry: LogEntry,
}

/// Response for GET `/logs/{origin}/proof`
#[derive(Debug, Serialize, Deserialize)]
pub struct InclusionProofResponse {
    /// Log origin
    pub origin: String,
    /// Root the proof reaches
    #[serde(with = "crate::hash_format")]
    pub root_hash: Hash,
    /// The inclusion proof
    pub proof: InclusionProof,
}

/// Response for GET `/logs/{origin}/consistency`
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsistencyProofResponse {
    /// Log origin
    pub origin: String,
    /// Root at `old_size`
    #[serde(with = "crate::hash_format")]
    pub old_root: Hash,
    /// Root at `new_size`
    #[serde(with = "crate::hash_format")]
    pub new_root: Hash,
    /// The consistency proof
    pub proof: ConsistencyProof,
}

/// Response for GET `/evidence/{tenant}/{asset}/{evidence}`
#[derive(Debug, Serialize, Deserialize)]
pub struct EvidenceResponse {
    /// Key of `record.json`
    pub object_key: String,
    /// Latest record
    pub record: EvidenceRecord,
    /// Every stored version, oldest first
    pub versions: Vec<ObjectMeta>,
    /// Latest leaf that logged the item
    pub leaf_index: Option<u64>,
    /// Proof of that leaf against the current tree
    pub inclusion_proof: Option<InclusionProof>,
    /// Parsed time-stamp, when one is attached
    pub timestamp: Option<TstInfo>,
    /// Whether an active hold covers the item
    pub under_hold: bool,
}

/// Response for GET `/admin/status`
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessorStatusResponse {
    /// `running`, `paused` or `stopping`
    pub processor: String,
}

/// Response for GET /metrics
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    /// Log origin
    pub origin: String,
    /// Custody counters
    pub counters: CountersSnapshot,
    /// Last background cycle
    pub cycle: CycleMetrics,
    /// Proof endpoint latencies
    pub http: HttpMetricsSnapshot,
    /// Holds due for review at the last sweep
    pub review: Option<ReviewReport>,
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_the_kind() {
        let body = serde_json::to_value(ApiResponse::<()>::error(&Error::not_found("leaf 9"))).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["error_type"], "not_found");
        assert!(body["error"].as_str().unwrap().contains("leaf 9"));

        let ok = serde_json::to_value(ApiResponse::success(SizeResponse {
            origin: "o".into(),
            size: 3,
        }))
        .unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["size"], 3);
    }

    #[test]
    fn write_path_errors_have_distinct_statuses() {
        let statuses = [
            status_for(ErrorKind::Validation),
            status_for(ErrorKind::Storage),
            status_for(ErrorKind::TsaRejected),
            status_for(ErrorKind::ConsistencyViolation),
        ];
        for (i, a) in statuses.iter().enumerate() {
            for b in &statuses[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
