use anyhow::Result;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::export::{DownloadLink, ExportScope, ExportStatus};
use crate::hold::{LegalHold, PlaceHold};
use crate::ingest::IngestReceipt;
use crate::log::Checkpoint;
use crate::service::responses::{
    ApiResponse, ConsistencyProofResponse, EntryResponse, EvidenceResponse, InclusionProofResponse,
    MetricsResponse, ProcessorStatusResponse, RootResponse, SizeResponse,
};
use crate::service::routes::{
    ConsistencyQuery, HoldsQuery, InclusionQuery, IngestRequest, LinkRequest, ReleaseRequest,
};
use crate::Hash;

/// An error envelope returned by the server.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct RemoteError {
    /// What the client was doing
    pub operation: String,
    /// Error class reported by the server
    pub kind: String,
    /// Server message
    pub message: String,
}

impl RemoteError {
    /// Whether the server reported `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind.as_str()
    }
}

/// HTTP client for the custody service
pub struct Client {
    /// HTTP client for making requests to the API
    http_client: HttpClient,
    /// Base URL of the custody service API
    api_base_url: String,
}

impl Client {
    /// Creates a new HTTP client for the custody service
    ///
    /// # Errors
    ///
    /// Returns an error if the `HTTPClient` build fails.
    pub fn new(api_base_url: &str) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http_client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    fn log_url(&self, origin: &str, tail: &str) -> String {
        // Origins usually contain '/', which must stay inside one segment.
        self.url(&format!("/logs/{}/{tail}", origin.replace('%', "%25").replace('/', "%2F")))
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response, operation: &str) -> Result<T> {
        match response.json::<ApiResponse<T>>().await? {
            ApiResponse::Success(data) => Ok(data),
            ApiResponse::Error { error, error_type } => Err(RemoteError {
                operation: operation.to_string(),
                kind: error_type.map_or_else(|| "unknown".to_string(), |k| k.as_str().to_string()),
                message: error,
            }
            .into()),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: String, operation: &str) -> Result<T> {
        Self::read(self.http_client.get(url).send().await?, operation).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
        operation: &str,
    ) -> Result<T> {
        Self::read(self.http_client.post(url).json(body).send().await?, operation).await
    }

    /// Gets the current size of the log
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_log_size(&self, origin: &str) -> Result<u64> {
        let data: SizeResponse = self.get(self.log_url(origin, "size"), "get log size").await?;
        Ok(data.size)
    }

    /// Gets the current root and tree size
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_root(&self, origin: &str) -> Result<(Hash, u64)> {
        let data: RootResponse = self.get(self.log_url(origin, "root"), "get root").await?;
        Ok((data.root_hash, data.tree_size))
    }

    /// Gets one log entry
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_entry(&self, origin: &str, index: u64) -> Result<EntryResponse> {
        self.get(self.log_url(origin, &format!("entries/{index}")), "get entry")
            .await
    }

    /// Gets an inclusion proof for `index`, against `tree_size` or the current tree
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_inclusion_proof(
        &self,
        origin: &str,
        index: u64,
        tree_size: Option<u64>,
    ) -> Result<InclusionProofResponse> {
        let query = InclusionQuery { index, tree_size };
        let response = self
            .http_client
            .get(self.log_url(origin, "proof"))
            .query(&query)
            .send()
            .await?;
        Self::read(response, "get inclusion proof").await
    }

    /// Gets a consistency proof between two tree sizes
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_consistency_proof(
        &self,
        origin: &str,
        old_size: u64,
        new_size: Option<u64>,
    ) -> Result<ConsistencyProofResponse> {
        let query = ConsistencyQuery { old_size, new_size };
        let response = self
            .http_client
            .get(self.log_url(origin, "consistency"))
            .query(&query)
            .send()
            .await?;
        Self::read(response, "get consistency proof").await
    }

    /// Verifies that the current tree extends a previously observed one.
    /// Returns the current root and size.
    ///
    /// # Errors
    ///
    /// Returns an error if fetching the proof fails or the proof does not
    /// link `old_root` to the root the server reports.
    pub async fn verify_tree_consistency(
        &self,
        origin: &str,
        old_size: u64,
        old_root: &Hash,
    ) -> Result<(Hash, u64)> {
        let data = self.get_consistency_proof(origin, old_size, None).await?;
        if data.old_root != *old_root {
            anyhow::bail!("server root at size {old_size} differs from the observed root");
        }
        if !data.proof.verify(old_root, &data.new_root) {
            anyhow::bail!("consistency proof from {old_size} to {} failed", data.proof.new_size);
        }
        Ok((data.new_root, data.proof.new_size))
    }

    /// Gets the latest signed checkpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_checkpoint(&self, origin: &str) -> Result<Checkpoint> {
        self.get(self.log_url(origin, "checkpoint"), "get checkpoint")
            .await
    }

    /// Asks the server to sign a checkpoint now
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn create_checkpoint(&self, origin: &str) -> Result<Checkpoint> {
        let response = self
            .http_client
            .post(self.log_url(origin, "checkpoint"))
            .send()
            .await?;
        Self::read(response, "create checkpoint").await
    }

    /// Submits one evidence item
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn ingest(&self, request: &IngestRequest) -> Result<IngestReceipt> {
        self.post(self.url("/evidence"), request, "ingest").await
    }

    /// Reads one evidence item with its proof and time-stamp
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_evidence(&self, tenant: &str, asset: &str, evidence: &str) -> Result<EvidenceResponse> {
        self.get(
            self.url(&format!("/evidence/{tenant}/{asset}/{evidence}")),
            "get evidence",
        )
        .await
    }

    /// Places a legal hold
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn place_hold(&self, request: &PlaceHold) -> Result<LegalHold> {
        self.post(self.url("/holds"), request, "place hold").await
    }

    /// Releases a legal hold
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn release_hold(&self, hold_id: &str, reason: &str, released_by: &str) -> Result<LegalHold> {
        let body = ReleaseRequest {
            reason: reason.to_string(),
            released_by: released_by.to_string(),
        };
        self.post(self.url(&format!("/holds/{hold_id}/release")), &body, "release hold")
            .await
    }

    /// Lists holds
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn list_holds(&self, include_ended: bool) -> Result<Vec<LegalHold>> {
        let response = self
            .http_client
            .get(self.url("/holds"))
            .query(&HoldsQuery { include_ended })
            .send()
            .await?;
        Self::read(response, "list holds").await
    }

    /// Starts an export
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn create_export(&self, scope: &ExportScope) -> Result<ExportStatus> {
        self.post(self.url("/exports"), scope, "create export").await
    }

    /// Polls an export
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_export(&self, export_id: &str) -> Result<ExportStatus> {
        self.get(self.url(&format!("/exports/{export_id}")), "get export")
            .await
    }

    /// Cancels a building export
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn cancel_export(&self, export_id: &str) -> Result<ExportStatus> {
        let response = self
            .http_client
            .delete(self.url(&format!("/exports/{export_id}")))
            .send()
            .await?;
        Self::read(response, "cancel export").await
    }

    /// Issues a download link valid for `ttl_secs`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn export_link(&self, export_id: &str, ttl_secs: i64) -> Result<DownloadLink> {
        self.post(
            self.url(&format!("/exports/{export_id}/link")),
            &LinkRequest { ttl_secs },
            "issue download link",
        )
        .await
    }

    /// Downloads an archive through a link token
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the token is rejected.
    pub async fn download(&self, token: &str) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .get(self.url(&format!("/downloads/{token}")))
            .send()
            .await?;
        if !response.status().is_success() {
            return Self::read::<()>(response, "download").await.map(|()| Vec::new());
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Gets service metrics
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn get_metrics(&self) -> Result<MetricsResponse> {
        self.get(self.url("/metrics"), "get metrics").await
    }

    /// Sends `pause`, `resume` or `stop` to the processor
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn admin(&self, action: &str) -> Result<String> {
        let response = self
            .http_client
            .post(self.url(&format!("/admin/{action}")))
            .send()
            .await?;
        let data: ProcessorStatusResponse = Self::read(response, action).await?;
        Ok(data.processor)
    }

    /// Reads the processor state
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error envelope.
    pub async fn processor_status(&self) -> Result<String> {
        let data: ProcessorStatusResponse = self.get(self.url("/admin/status"), "admin status").await?;
        Ok(data.processor)
    }
}
