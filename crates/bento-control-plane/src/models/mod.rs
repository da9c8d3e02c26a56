pub mod state;

use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
pub use state::{BentoVersionChanges, BuildStatus, UploadStatus};

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct BentoVersion {
	pub id: i64,
	pub bento_id: i64,
	pub creator_id: i64,
	pub version: String,
	pub description: String,
	#[sqlx(try_from = "String")]
	pub build_status: BuildStatus,
	#[sqlx(try_from = "String")]
	pub upload_status: UploadStatus,
	pub build_at: DateTime<Utc>,
	pub upload_started_at: Option<DateTime<Utc>>,
	pub upload_finished_at: Option<DateTime<Utc>>,
	pub upload_finished_reason: Option<String>,
	#[schema(value_type = Option<Object>)]
	pub manifest: Option<serde_json::Value>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Input for registering a new version. Both statuses start as `pending`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateBentoVersion {
	pub creator_id: i64,
	pub bento_id: i64,
	pub version: String,
	#[serde(default)]
	pub description: String,
	pub build_at: DateTime<Utc>,
	#[serde(default)]
	#[schema(value_type = Option<Object>)]
	pub manifest: Option<serde_json::Value>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bento { pub id: i64, pub organization_id: i64, pub name: String }

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Organization {
	pub id: i64,
	pub name: String,
	pub config: Option<sqlx::types::Json<OrganizationConfig>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OrganizationConfig {
	#[serde(default)]
	pub aws: Option<AwsConfig>,
	/// Cluster that runs build jobs. Falls back to the organization's oldest cluster.
	#[serde(default)]
	pub major_cluster_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AwsConfig {
	pub access_key_id: String,
	pub secret_access_key: String,
	#[serde(default)]
	pub s3: Option<S3Config>,
	#[serde(default)]
	pub ecr: Option<EcrConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct S3Config {
	pub bucket_name: String,
	pub region: String,
	/// Custom S3-compatible endpoint; AWS when absent.
	#[serde(default)]
	pub endpoint: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EcrConfig { pub repository_uri: String }

/// Object store coordinates and credentials resolved from an organization's config.
#[derive(Clone, PartialEq)]
pub struct StorageTarget {
	pub access_key_id: String,
	pub secret_access_key: String,
	pub bucket_name: String,
	pub region: String,
	pub endpoint: Option<String>,
}

impl std::fmt::Debug for StorageTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StorageTarget").field("bucket_name", &self.bucket_name).field("region", &self.region).field("endpoint", &self.endpoint).finish()
	}
}

impl Organization {
	pub fn config(&self) -> Option<&OrganizationConfig> { self.config.as_deref() }

	fn aws(&self) -> Result<&AwsConfig> {
		let config = self.config().ok_or_else(|| Error::config(format!("organization {} does not have configuration", self.name)))?;
		let aws = config.aws.as_ref().ok_or_else(|| Error::config(format!("organization {} does not have aws config", self.name)))?;
		if aws.access_key_id.trim().is_empty() || aws.secret_access_key.trim().is_empty() {
			return Err(Error::config(format!("organization {} has incomplete aws credentials", self.name)));
		}
		Ok(aws)
	}

	pub fn storage_target(&self) -> Result<StorageTarget> {
		let aws = self.aws()?;
		let s3 = aws.s3.as_ref().ok_or_else(|| Error::config(format!("organization {} does not have aws s3 storage set up", self.name)))?;
		if s3.bucket_name.trim().is_empty() || s3.region.trim().is_empty() {
			return Err(Error::config(format!("organization {} has incomplete s3 config", self.name)));
		}
		Ok(StorageTarget {
			access_key_id: aws.access_key_id.clone(),
			secret_access_key: aws.secret_access_key.clone(),
			bucket_name: s3.bucket_name.clone(),
			region: s3.region.clone(),
			endpoint: s3.endpoint.clone().filter(|e| !e.trim().is_empty()),
		})
	}

	pub fn registry_uri(&self) -> Result<&str> {
		let ecr = self.aws()?.ecr.as_ref().ok_or_else(|| Error::config(format!("organization {} doesn't have ECR config", self.name)))?;
		if ecr.repository_uri.trim().is_empty() {
			return Err(Error::config(format!("organization {} has an empty ECR repository uri", self.name)));
		}
		Ok(&ecr.repository_uri)
	}

	pub fn major_cluster_name(&self) -> Option<&str> {
		self.config().and_then(|c| c.major_cluster_name.as_deref()).filter(|n| !n.trim().is_empty())
	}
}

/// A Kubernetes cluster registered for an organization.
#[derive(sqlx::FromRow, Clone, PartialEq)]
pub struct Cluster {
	pub id: i64,
	pub organization_id: i64,
	pub name: String,
	/// Serialized kubeconfig; empty means "use the ambient identity".
	pub kube_config: String,
}

impl std::fmt::Debug for Cluster {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cluster").field("id", &self.id).field("name", &self.name).field("ambient", &self.kube_config.trim().is_empty()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn org(config: Option<OrganizationConfig>) -> Organization {
		Organization { id: 1, name: "acme".into(), config: config.map(sqlx::types::Json) }
	}

	fn full_aws() -> AwsConfig {
		AwsConfig {
			access_key_id: "AKIA".into(),
			secret_access_key: "secret".into(),
			s3: Some(S3Config { bucket_name: "bentos".into(), region: "us-west-2".into(), endpoint: Some(" ".into()) }),
			ecr: Some(EcrConfig { repository_uri: "1.dkr.ecr.us-west-2.amazonaws.com/acme".into() }),
		}
	}

	#[test]
	fn missing_config_is_a_config_error() {
		assert!(matches!(org(None).storage_target(), Err(Error::Config(_))));
		assert!(matches!(org(Some(OrganizationConfig::default())).registry_uri(), Err(Error::Config(_))));
	}

	#[test]
	fn missing_s3_or_ecr_is_reported_separately() {
		let mut aws = full_aws();
		aws.s3 = None;
		let o = org(Some(OrganizationConfig { aws: Some(aws), major_cluster_name: None }));
		assert!(matches!(o.storage_target(), Err(Error::Config(m)) if m.contains("s3")));
		assert!(o.registry_uri().is_ok());

		let mut aws = full_aws();
		aws.ecr = None;
		let o = org(Some(OrganizationConfig { aws: Some(aws), major_cluster_name: None }));
		assert!(o.storage_target().is_ok());
		assert!(matches!(o.registry_uri(), Err(Error::Config(m)) if m.contains("ECR")));
	}

	#[test]
	fn blank_endpoint_means_aws() {
		let o = org(Some(OrganizationConfig { aws: Some(full_aws()), major_cluster_name: Some("".into()) }));
		let target = o.storage_target().unwrap();
		assert_eq!(target.endpoint, None);
		assert_eq!(target.bucket_name, "bentos");
		assert_eq!(o.major_cluster_name(), None);
	}

	#[test]
	fn storage_target_debug_hides_secrets() {
		let o = org(Some(OrganizationConfig { aws: Some(full_aws()), major_cluster_name: None }));
		let rendered = format!("{:?}", o.storage_target().unwrap());
		assert!(!rendered.contains("secret"));
		assert!(!rendered.contains("AKIA"));
	}
}
