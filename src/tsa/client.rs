use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::request::{HashAlgorithm, TimeStampRequest};
use super::response::{TimeStampResponse, TstInfo};
use crate::error::{Error, Result};
use crate::retry::RetryExecutor;

/// Media type of a DER `TimeStampReq`.
pub const QUERY_CONTENT_TYPE: &str = "application/timestamp-query";
/// Media type of a DER `TimeStampResp`.
pub const REPLY_CONTENT_TYPE: &str = "application/timestamp-reply";

/// Moves DER requests to an authority and DER responses back.
#[async_trait]
pub trait TsaTransport: Send + Sync {
    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Returns `Error::TsaUnavailable` when the authority cannot be reached.
    async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>>;
}

/// HTTPS transport with an explicit timeout.
pub struct HttpTransport {
    http_client: HttpClient,
    url: String,
}

impl HttpTransport {
    /// Creates a transport posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::TsaUnavailable` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::TsaUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }

    /// Authority URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TsaTransport for HttpTransport {
    async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .http_client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, QUERY_CONTENT_TYPE)
            .body(request)
            .send()
            .await
            .map_err(|e| Error::TsaUnavailable(format!("{}: {e}", self.url)))?;

        if !response.status().is_success() {
            return Err(Error::TsaUnavailable(format!(
                "{} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::TsaUnavailable(format!("reading reply: {e}")))?;
        Ok(body.to_vec())
    }
}

/// A granted time-stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// DER `TimeStampToken`
    #[serde(with = "crate::bytes_format")]
    pub token: Vec<u8>,
    /// Time asserted by the authority
    pub gen_time: DateTime<Utc>,
    /// Imprint algorithm
    pub algorithm: HashAlgorithm,
    /// Token serial number, hex
    pub serial: String,
}

/// RFC 3161 client.
#[derive(Clone)]
pub struct TsaClient {
    transport: Arc<dyn TsaTransport>,
    algorithm: HashAlgorithm,
    policy: Option<String>,
    retry: RetryExecutor,
}

impl TsaClient {
    /// Creates a client over any transport.
    pub fn new(
        transport: Arc<dyn TsaTransport>,
        algorithm: HashAlgorithm,
        policy: Option<String>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            transport,
            algorithm,
            policy,
            retry,
        }
    }

    /// Default imprint algorithm.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Time-stamps `payload` with the configured algorithm.
    ///
    /// # Errors
    ///
    /// See [`TsaClient::timestamp_with`].
    pub async fn timestamp(&self, payload: &[u8]) -> Result<Timestamp> {
        self.timestamp_with(payload, self.algorithm).await
    }

    /// Time-stamps `payload`.
    ///
    /// Every attempt carries its own nonce. Unreachable authorities are
    /// retried; refusals are not.
    ///
    /// # Errors
    ///
    /// Returns `Error::TsaUnavailable` once retries are exhausted, or
    /// `Error::TsaRejected` when the authority refuses or answers with a
    /// token that does not match the request.
    pub async fn timestamp_with(
        &self,
        payload: &[u8],
        algorithm: HashAlgorithm,
    ) -> Result<Timestamp> {
        let stamp = self
            .retry
            .execute("tsa.timestamp", || async move {
                let request = TimeStampRequest::new(payload, algorithm, self.policy.clone());
                let reply = self.transport.send(request.to_der()?).await?;
                accept(&request, &reply)
            })
            .await;

        match &stamp {
            Ok(stamp) => info!(
                algorithm = %algorithm,
                gen_time = %stamp.gen_time,
                serial = %stamp.serial,
                "time-stamp granted"
            ),
            Err(e) => warn!(algorithm = %algorithm, error = %e, "time-stamp failed"),
        }
        stamp
    }
}

/// Checks a reply against the request that produced it.
fn accept(request: &TimeStampRequest, reply: &[u8]) -> Result<Timestamp> {
    let response = TimeStampResponse::from_der(reply).map_err(|e| Error::TsaRejected {
        status: -1,
        reason: format!("unparseable response: {e}"),
    })?;
    if !response.granted() {
        return Err(Error::TsaRejected {
            status: response.status,
            reason: response.reason(),
        });
    }
    let token = response.token.ok_or_else(|| Error::TsaRejected {
        status: response.status,
        reason: "granted without a token".into(),
    })?;
    let info = TstInfo::from_token(&token).map_err(|e| Error::TsaRejected {
        status: -1,
        reason: format!("unparseable token: {e}"),
    })?;

    if info.algorithm != request.algorithm || info.imprint != request.imprint {
        return Err(Error::TsaRejected {
            status: -1,
            reason: "token imprint does not match the request".into(),
        });
    }
    if let Some(nonce) = info.nonce {
        if nonce != request.nonce {
            return Err(Error::TsaRejected {
                status: -1,
                reason: format!("nonce mismatch: sent {}, got {nonce}", request.nonce),
            });
        }
    }
    debug!(nonce = request.nonce, "time-stamp reply accepted");

    Ok(Timestamp {
        token,
        gen_time: info.gen_time,
        algorithm: info.algorithm,
        serial: hex::encode(&info.serial),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::tsa::mock::{Behavior, MockAuthority};

    fn client(authority: &Arc<MockAuthority>, attempts: u32) -> TsaClient {
        TsaClient::new(
            authority.clone(),
            HashAlgorithm::Sha256,
            Some("1.2.3.4.1".into()),
            RetryExecutor::new(RetryConfig::immediate(attempts)),
        )
    }

    #[tokio::test]
    async fn granted_token_covers_payload() {
        let authority = Arc::new(MockAuthority::default());
        let stamp = client(&authority, 3).timestamp(b"record").await.unwrap();
        let info = TstInfo::from_token(&stamp.token).unwrap();
        assert!(info.covers(b"record"));
        assert_eq!(info.policy, "1.2.3.4.1");
        assert_eq!(stamp.gen_time, info.gen_time);
        assert_eq!(authority.requests(), 1);
    }

    #[tokio::test]
    async fn each_attempt_uses_a_new_nonce() {
        let authority = Arc::new(MockAuthority::default());
        authority.fail_next(2);
        client(&authority, 3).timestamp(b"record").await.unwrap();
        let nonces = authority.nonces();
        assert_eq!(nonces.len(), 3);
        let unique: std::collections::HashSet<_> = nonces.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_unavailable() {
        let authority = Arc::new(MockAuthority::default());
        authority.fail_next(5);
        let err = client(&authority, 3).timestamp(b"record").await.unwrap_err();
        assert!(matches!(err, Error::TsaUnavailable(_)));
        assert_eq!(authority.requests(), 3);
    }

    #[tokio::test]
    async fn refusal_is_not_retried() {
        let authority = Arc::new(MockAuthority::default());
        authority.set_behavior(Behavior::Reject {
            status: 2,
            reason: "unsupported policy".into(),
        });
        let err = client(&authority, 3).timestamp(b"record").await.unwrap_err();
        match err {
            Error::TsaRejected { status, reason } => {
                assert_eq!(status, 2);
                assert_eq!(reason, "unsupported policy");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(authority.requests(), 1);
    }

    #[tokio::test]
    async fn mismatched_replies_are_rejected() {
        let authority = Arc::new(MockAuthority::default());
        authority.set_behavior(Behavior::WrongNonce);
        let err = client(&authority, 1).timestamp(b"record").await.unwrap_err();
        assert!(matches!(err, Error::TsaRejected { status: -1, .. }));

        authority.set_behavior(Behavior::WrongImprint);
        let err = client(&authority, 1).timestamp(b"record").await.unwrap_err();
        assert!(matches!(err, Error::TsaRejected { status: -1, .. }));
    }
}
