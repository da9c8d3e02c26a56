use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::StorageTarget;

/// Validity window of every issued upload URL.
pub const UPLOAD_URL_TTL: Duration = Duration::from_secs(3600);

const DEFAULT_S3_ENDPOINT: &str = "https://s3.amazonaws.com";

#[derive(Debug, Clone, PartialEq)]
pub struct PresignedUpload { pub url: String, pub method: String, pub headers: std::collections::HashMap<String,String>, pub storage_key: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState { Created, AlreadyOwned }

/// Per-organization access to an S3-compatible store. Credentials travel with
/// every call so one gateway serves all tenants.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync + 'static {
    /// Create the bucket unless it already exists and is ours.
    async fn ensure_bucket(&self, target: &StorageTarget) -> Result<BucketState>;
    /// Presigned PUT for exactly `key`, valid for `expires`.
    async fn presign_upload(&self, target: &StorageTarget, key: &str, expires: Duration) -> Result<PresignedUpload>;
}

#[derive(Debug, Clone, Default)]
pub struct S3Gateway;

impl S3Gateway {
    fn client(target: &StorageTarget) -> aws_sdk_s3::Client {
        use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
        let creds = Credentials::new(&target.access_key_id, &target.secret_access_key, None, None, "organization-config");
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(target.region.clone()))
            .credentials_provider(creds);
        builder = match &target.endpoint {
            // S3-compatible stores (MinIO etc.) need path-style addressing
            Some(ep) => builder.endpoint_url(ep).force_path_style(true),
            None => builder,
        };
        aws_sdk_s3::Client::from_conf(builder.build())
    }
}

#[async_trait]
impl ObjectStoreGateway for S3Gateway {
    async fn ensure_bucket(&self, target: &StorageTarget) -> Result<BucketState> {
        use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
        let client = Self::client(target);
        let bucket = &target.bucket_name;
        let mut req = client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint
        if target.region != "us-east-1" {
            let cfg = CreateBucketConfiguration::builder().location_constraint(BucketLocationConstraint::from(target.region.as_str())).build();
            req = req.create_bucket_configuration(cfg);
        }
        let create_err = match req.send().await {
            Ok(_) => { info!(bucket=%bucket, endpoint=?target.endpoint, "storage.bucket_created"); return Ok(BucketState::Created); }
            Err(e) => e,
        };
        if create_err.as_service_error().is_some_and(|se| se.is_bucket_already_owned_by_you()) {
            debug!(bucket=%bucket, "storage.bucket_already_owned");
            return Ok(BucketState::AlreadyOwned);
        }
        // Some S3-compatible stores report ownership differently; probe before failing
        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => { debug!(bucket=%bucket, "storage.bucket_exists"); Ok(BucketState::AlreadyOwned) }
            Err(probe) => {
                warn!(bucket=%bucket, error=?create_err, probe_error=?probe, "storage.create_bucket_failed");
                Err(Error::object_store("create bucket", format!("{bucket}: {create_err}")))
            }
        }
    }

    async fn presign_upload(&self, target: &StorageTarget, key: &str, expires: Duration) -> Result<PresignedUpload> {
        use aws_sdk_s3::presigning::PresigningConfig;
        let config = PresigningConfig::expires_in(expires).map_err(|e| Error::object_store("presign", e))?;
        let presigned = Self::client(target).put_object().bucket(&target.bucket_name).key(key)
            .presigned(config).await
            .map_err(|e| Error::object_store("presign", format!("{}/{key}: {e}", target.bucket_name)))?;
        let mut headers = std::collections::HashMap::new();
        for (k,v) in presigned.headers() { headers.insert(k.to_string(), v.to_string()); }
        Ok(PresignedUpload { url: presigned.uri().to_string(), method: "PUT".into(), headers, storage_key: key.to_string() })
    }
}

/// Human-readable endpoint for logs.
pub fn endpoint_of(target: &StorageTarget) -> &str { target.endpoint.as_deref().unwrap_or(DEFAULT_S3_ENDPOINT) }

#[cfg(test)]
mod tests {
    use super::*;

    fn target(endpoint: Option<&str>) -> StorageTarget {
        StorageTarget {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI".into(),
            bucket_name: "acme-bentos".into(),
            region: "us-west-2".into(),
            endpoint: endpoint.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn presign_targets_exact_object() {
        let p = S3Gateway.presign_upload(&target(Some("http://localhost:9000")), "bentos/acme/resnet/1.0.0.tar.gz", UPLOAD_URL_TTL).await.unwrap();
        assert_eq!(p.method, "PUT");
        assert_eq!(p.storage_key, "bentos/acme/resnet/1.0.0.tar.gz");
        assert!(p.url.starts_with("http://localhost:9000/acme-bentos/bentos/acme/resnet/1.0.0.tar.gz?"), "{}", p.url);
        assert!(p.url.contains("X-Amz-Expires=3600"), "{}", p.url);
    }

    #[tokio::test]
    async fn presign_rejects_ttl_over_a_week() {
        let err = S3Gateway.presign_upload(&target(None), "k", Duration::from_secs(8 * 24 * 3600)).await.unwrap_err();
        assert!(matches!(err, Error::ObjectStore { op: "presign", .. }));
    }

    #[test]
    fn endpoint_defaults_to_aws() {
        assert_eq!(endpoint_of(&target(None)), DEFAULT_S3_ENDPOINT);
        assert_eq!(endpoint_of(&target(Some("http://minio:9000"))), "http://minio:9000");
    }
}
