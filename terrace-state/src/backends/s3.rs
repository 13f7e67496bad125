//! S3 backend for state storage
//!
//! The lock object is written with `If-None-Match: *`, so S3 itself rejects a
//! second writer. An expired lock is replaced with `If-Match` on the ETag it
//! was read with, so of two runs taking it over only one wins.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration,
    PublicAccessBlockConfiguration, ServerSideEncryption, ServerSideEncryptionByDefault,
    ServerSideEncryptionConfiguration, ServerSideEncryptionRule, VersioningConfiguration,
};

use terrace_core::loader::BackendSettings;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::StateFile;

/// S3-based state backend
pub struct S3Backend {
    client: Client,
    bucket: String,
    /// Object key for the state file
    key: String,
    region: String,
    /// Whether to encrypt the state file (default: true)
    encrypt: bool,
    /// Whether to auto-create the bucket if it doesn't exist (default: true)
    auto_create: bool,
}

impl S3Backend {
    /// Create a new S3Backend from a `backend s3 { ... }` block
    pub async fn from_config(config: &BackendSettings) -> BackendResult<Self> {
        let bucket = config
            .get_string("bucket")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: bucket"))?
            .to_string();

        let key = config
            .get_string("key")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: key"))?
            .to_string();

        let region = config
            .get_string("region")
            .ok_or_else(|| BackendError::configuration("Missing required attribute: region"))?
            .to_string();

        let encrypt = config.get_bool("encrypt").unwrap_or(true);
        let auto_create = config.get_bool("auto_create").unwrap_or(true);

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()))
            .load()
            .await;

        Ok(Self {
            client: Client::new(&aws_config),
            bucket,
            key,
            region,
            encrypt,
            auto_create,
        })
    }

    /// Get the lock file key (state key + ".lock")
    fn lock_key(&self) -> String {
        lock_key_for(&self.key)
    }

    async fn get_json(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| BackendError::Io(e.to_string()))?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(err) if status_of(&err) == Some(404) => Ok(None),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        Ok(self.read_lock_tagged().await?.map(|(lock, _)| lock))
    }

    /// The lock object and the ETag it was read with
    async fn read_lock_tagged(&self) -> BackendResult<Option<(LockInfo, String)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.lock_key())
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if status_of(&err) == Some(404) => return Ok(None),
            Err(err) => return Err(BackendError::Aws(err.to_string())),
        };
        let etag = output.e_tag().unwrap_or_default().to_string();
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        let lock = LockInfo::from_json(&body.into_bytes())
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        Ok(Some((lock, etag)))
    }

    /// Write the lock object
    ///
    /// With `replacing` unset the write only succeeds if no lock exists;
    /// otherwise only if the lock still has that ETag.
    async fn put_lock(&self, lock: &LockInfo, replacing: Option<&str>) -> BackendResult<bool> {
        let body = lock
            .to_json()
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.lock_key())
            .body(ByteStream::from(body))
            .content_type("application/json");

        request = match replacing {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };
        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if lost_race(status_of(&err)) => Ok(false),
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    async fn delete_lock(&self) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.lock_key())
            .send()
            .await
            .map_err(|e| BackendError::Aws(e.to_string()))?;

        Ok(())
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub async fn bucket_exists(&self) -> BackendResult<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if status_of(&err) == Some(404) || err.as_service_error().is_some() => {
                Ok(false)
            }
            Err(err) => Err(BackendError::Aws(err.to_string())),
        }
    }

    /// Create the state bucket: versioned, encrypted and private
    pub async fn create_bucket(&self) -> BackendResult<()> {
        log::info!("Creating state bucket {}", self.bucket);
        let mut create_request = self.client.create_bucket().bucket(&self.bucket);

        if self.region != "us-east-1" {
            let config = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                .build();
            create_request = create_request.create_bucket_configuration(config);
        }

        create_request
            .send()
            .await
            .map_err(|e| BackendError::BucketCreationFailed(e.to_string()))?;

        let versioning_config = VersioningConfiguration::builder()
            .status(BucketVersioningStatus::Enabled)
            .build();
        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(versioning_config)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to enable versioning: {}", e)))?;

        let default_encryption = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::Aes256)
            .build()
            .map_err(|e| BackendError::Aws(e.to_string()))?;
        let encryption = ServerSideEncryptionConfiguration::builder()
            .rules(
                ServerSideEncryptionRule::builder()
                    .apply_server_side_encryption_by_default(default_encryption)
                    .build(),
            )
            .build()
            .map_err(|e| BackendError::Aws(e.to_string()))?;
        self.client
            .put_bucket_encryption()
            .bucket(&self.bucket)
            .server_side_encryption_configuration(encryption)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to enable encryption: {}", e)))?;

        let public_access_block = PublicAccessBlockConfiguration::builder()
            .block_public_acls(true)
            .block_public_policy(true)
            .ignore_public_acls(true)
            .restrict_public_buckets(true)
            .build();
        self.client
            .put_public_access_block()
            .bucket(&self.bucket)
            .public_access_block_configuration(public_access_block)
            .send()
            .await
            .map_err(|e| BackendError::Aws(format!("Failed to block public access: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl StateBackend for S3Backend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        match self.get_json(&self.key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BackendError::InvalidState(e.to_string())),
            None => Ok(None),
        }
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(body))
            .content_type("application/json");

        if self.encrypt {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request
            .send()
            .await
            .map_err(|e| BackendError::Aws(e.to_string()))?;

        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let lock = LockInfo::new(operation);
        for _ in 0..LOCK_ATTEMPTS {
            if self.put_lock(&lock, None).await? {
                return Ok(lock);
            }
            match self.read_lock_tagged().await? {
                Some((existing, _)) if !existing.is_expired() => {
                    return Err(BackendError::locked(&existing));
                }
                Some((existing, etag)) => {
                    if self.put_lock(&lock, Some(&etag)).await? {
                        log::warn!(
                            "Took over expired lock {} held by {}",
                            existing.id,
                            existing.who
                        );
                        return Ok(lock);
                    }
                }
                // Released between our write and read
                None => {}
            }
        }
        match self.read_lock().await? {
            Some(existing) => Err(BackendError::locked(&existing)),
            None => Err(BackendError::Aws("Lock object kept changing while locking".to_string())),
        }
    }

    async fn renew_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let (existing, etag) = self
            .read_lock_tagged()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;
        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }
        if existing.is_expired() {
            return Err(BackendError::LockNotFound(format!(
                "{} expired before it was renewed",
                lock.id
            )));
        }
        if self.put_lock(lock, Some(&etag)).await? {
            Ok(())
        } else {
            Err(BackendError::LockNotFound(format!(
                "{} changed while it was renewed",
                lock.id
            )))
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.delete_lock().await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.delete_lock().await
    }

    async fn init(&self) -> BackendResult<()> {
        if !self.bucket_exists().await? {
            if self.auto_create {
                self.create_bucket().await?;
            } else {
                return Err(BackendError::BucketNotFound(self.bucket.clone()));
            }
        }
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Times the lock object may change hands under us before giving up
const LOCK_ATTEMPTS: usize = 3;

/// A conditional lock write failed because another writer got there first
///
/// 412: the precondition no longer holds; 409: a concurrent conditional
/// write won; 404: the lock being replaced is gone.
fn lost_race(status: Option<u16>) -> bool {
    matches!(status, Some(412) | Some(409) | Some(404))
}

fn lock_key_for(key: &str) -> String {
    format!("{}.lock", key)
}

/// HTTP status of a failed S3 call, when a response was received
fn status_of<E>(err: &aws_sdk_s3::error::SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_write_conflicts() {
        assert!(lost_race(Some(412)));
        assert!(lost_race(Some(409)));
        assert!(lost_race(Some(404)));
        assert!(!lost_race(Some(403)));
        assert!(!lost_race(None));
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(
            lock_key_for("issue-extractor/terrace.state.json"),
            "issue-extractor/terrace.state.json.lock"
        );
    }
}
