//! S3 backend using Object Lock in compliance mode.
//!
//! The bucket must be created with Object Lock (and therefore versioning)
//! enabled. The content digest is kept in user metadata so `head` can report
//! it without reading the body.

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{
    ChecksumAlgorithm, ObjectLockLegalHold, ObjectLockLegalHoldStatus, ObjectLockMode,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};

use super::object::{sha256_hex, ObjectMeta, ObjectStore, ObjectStoreError, PutOptions};

const SHA256_METADATA: &str = "sha256";

/// Object store over one S3 bucket.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from the ambient AWS configuration.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), bucket)
    }

    /// Wraps an existing client.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn to_aws(time: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(time.timestamp())
}

fn from_aws(time: Option<&AwsDateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_default()
}

fn map_error<E>(key: &str, err: SdkError<E>) -> ObjectStoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(_) => match err.code() {
            Some("NoSuchKey" | "NoSuchVersion" | "NotFound") => ObjectStoreError::NotFound {
                key: key.to_string(),
            },
            Some("AccessDenied") => ObjectStoreError::Locked {
                key: key.to_string(),
                reason: err.message().unwrap_or("access denied").to_string(),
            },
            code => ObjectStoreError::Backend {
                transient: matches!(code, Some("SlowDown" | "InternalError" | "ServiceUnavailable")),
                message: format!("s3 {key}: {err}"),
            },
        },
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ObjectStoreError::Backend {
                transient: true,
                message: format!("s3 {key}: {err}"),
            }
        }
        _ => ObjectStoreError::Backend {
            transient: false,
            message: format!("s3 {key}: {err}"),
        },
    }
}

impl S3ObjectStore {
    async fn head_version(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectMeta, ObjectStoreError> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(|e| map_error(key, e))?;

        Ok(ObjectMeta {
            key: key.to_string(),
            version_id: out.version_id().unwrap_or_default().to_string(),
            sha256: out
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA))
                .cloned()
                .unwrap_or_default(),
            size: out.content_length().and_then(|l| u64::try_from(l).ok()).unwrap_or(0),
            created_at: from_aws(out.last_modified()),
            retain_until: from_aws(out.object_lock_retain_until_date()),
            legal_hold: out.object_lock_legal_hold_status() == Some(&ObjectLockLegalHoldStatus::On),
            content_type: out.content_type().map(str::to_string),
        })
    }

    async fn fetch(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError> {
        let meta = self.head_version(key, version_id).await?;
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .version_id(&meta.version_id)
            .send()
            .await
            .map_err(|e| map_error(key, e))?;
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend {
                transient: true,
                message: format!("s3 {key}: reading body: {e}"),
            })?
            .into_bytes()
            .to_vec();
        Ok((meta, bytes))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        options: &PutOptions,
    ) -> Result<ObjectMeta, ObjectStoreError> {
        let sha256 = sha256_hex(&bytes);
        let size = bytes.len() as u64;
        let hold = if options.legal_hold {
            ObjectLockLegalHoldStatus::On
        } else {
            ObjectLockLegalHoldStatus::Off
        };

        // Lock mode, retention and hold travel with the write itself, so the
        // version never exists without them.
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .object_lock_mode(ObjectLockMode::Compliance)
            .object_lock_retain_until_date(to_aws(options.retain_until))
            .object_lock_legal_hold_status(hold)
            .metadata(SHA256_METADATA, &sha256)
            .set_content_type(options.content_type.clone())
            .send()
            .await
            .map_err(|e| map_error(key, e))?;

        tracing::debug!(bucket = %self.bucket, key, "object written with compliance lock");

        Ok(ObjectMeta {
            key: key.to_string(),
            version_id: out.version_id().unwrap_or_default().to_string(),
            sha256,
            size,
            created_at: Utc::now(),
            retain_until: options.retain_until,
            legal_hold: options.legal_hold,
            content_type: options.content_type.clone(),
        })
    }

    async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError> {
        self.fetch(key, None).await
    }

    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError> {
        self.fetch(key, Some(version_id)).await
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        self.head_version(key, None).await
    }

    async fn versions(&self, key: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let out = self
            .client
            .list_object_versions()
            .bucket(&self.bucket)
            .prefix(key)
            .send()
            .await
            .map_err(|e| map_error(key, e))?;

        let mut listed: Vec<(DateTime<Utc>, String)> = out
            .versions()
            .iter()
            .filter(|v| v.key() == Some(key))
            .filter_map(|v| Some((from_aws(v.last_modified()), v.version_id()?.to_string())))
            .collect();
        listed.sort();

        let mut metas = Vec::with_capacity(listed.len());
        for (_, version_id) in listed {
            metas.push(self.head_version(key, Some(&version_id)).await?);
        }
        Ok(metas)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let out = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| map_error(prefix, e))?;
            keys.extend(out.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            token = out.next_continuation_token().map(str::to_string);
            if token.is_none() {
                break;
            }
        }
        keys.sort();

        let mut metas = Vec::with_capacity(keys.len());
        for key in keys {
            metas.push(self.head_version(&key, None).await?);
        }
        Ok(metas)
    }

    async fn set_legal_hold(
        &self,
        key: &str,
        version_id: &str,
        on: bool,
    ) -> Result<ObjectMeta, ObjectStoreError> {
        let status = if on {
            ObjectLockLegalHoldStatus::On
        } else {
            ObjectLockLegalHoldStatus::Off
        };
        self.client
            .put_object_legal_hold()
            .bucket(&self.bucket)
            .key(key)
            .version_id(version_id)
            .legal_hold(ObjectLockLegalHold::builder().status(status).build())
            .send()
            .await
            .map_err(|e| map_error(key, e))?;
        self.head_version(key, Some(version_id)).await
    }

    async fn delete_version(&self, key: &str, version_id: &str) -> Result<(), ObjectStoreError> {
        let meta = self.head_version(key, Some(version_id)).await?;
        if let Some(reason) = meta.lock_reason(Utc::now()) {
            return Err(ObjectStoreError::Locked {
                key: key.to_string(),
                reason,
            });
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(())
    }
}
