//! Bento version orchestration.
//!
//! `BentoVersionService` owns every status change of a bento version. It
//! registers versions and hands out upload URLs, applies sparse status
//! updates, and kicks off the image build once an upload lands. The
//! database, object store and build cluster are all injected, so the same
//! flow runs against Postgres/S3/Kubernetes in production and against the
//! in-memory fakes in `test_support`.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::builder::{self, BuildCluster, BuildSpec, KubeBuildCluster, ProvisionReport};
use crate::cluster::ClusterResolver;
use crate::config::BuildSettings;
use crate::error::{Error, Result};
use crate::models::{Bento, BentoVersion, BentoVersionChanges, Cluster, CreateBentoVersion, Organization, StorageTarget, UploadStatus};
use crate::naming;
use crate::storage::{ObjectStoreGateway, PresignedUpload, UPLOAD_URL_TTL};
use crate::store::VersionStore;
use crate::telemetry::{UPLOAD_URL_FAILURES, VERSIONS_CREATED};

/// Opens a build-cluster session for a registered cluster.
#[async_trait]
pub trait ClusterConnector: Send + Sync + 'static {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn BuildCluster>>;
}

/// Connects through a fresh `kube::Client` per call.
#[derive(Debug, Clone, Default)]
pub struct KubeConnector { resolver: ClusterResolver }

impl KubeConnector {
    pub fn new(resolver: ClusterResolver) -> Self { Self { resolver } }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn BuildCluster>> {
        let (client, _config) = self.resolver.resolve(cluster).await?;
        Ok(Arc::new(KubeBuildCluster::new(client)))
    }
}

/// A freshly registered version plus where to upload its archive.
#[derive(Debug, Clone)]
pub struct Registration { pub version: BentoVersion, pub upload: PresignedUpload }

#[derive(Clone)]
pub struct BentoVersionService {
    store: Arc<dyn VersionStore>,
    objects: Arc<dyn ObjectStoreGateway>,
    clusters: Arc<dyn ClusterConnector>,
    build: BuildSettings,
}

impl BentoVersionService {
    pub fn new(store: Arc<dyn VersionStore>, objects: Arc<dyn ObjectStoreGateway>, clusters: Arc<dyn ClusterConnector>, build: BuildSettings) -> Self {
        Self { store, objects, clusters, build }
    }

    pub fn store(&self) -> &Arc<dyn VersionStore> { &self.store }

    async fn owners(&self, bento_id: i64) -> Result<(Bento, Organization)> {
        let bento = self.store.get_bento(bento_id).await?;
        let org = self.store.get_organization(bento.organization_id).await?;
        Ok((bento, org))
    }

    /// Record a new version and issue its upload URL.
    ///
    /// The row is committed before any object store call. When the URL cannot
    /// be issued the row stays and the error is `UploadUrlIssuance`; callers
    /// retry with [`issue_upload_url`](Self::issue_upload_url).
    #[tracing::instrument(level = "info", skip(self, new), fields(bento_id = new.bento_id, version = %new.version))]
    pub async fn create(&self, new: CreateBentoVersion) -> Result<Registration> {
        let (bento, org) = self.owners(new.bento_id).await?;
        let target = org.storage_target()?;
        let version = self.store.insert_version(&new).await?;
        VERSIONS_CREATED.inc();
        info!(version_id = version.id, "bento_version.created");
        match self.upload_url(&org, &bento, &version, &target).await {
            Ok(upload) => Ok(Registration { version, upload }),
            Err(e) => {
                UPLOAD_URL_FAILURES.inc();
                warn!(version_id = version.id, error = %e, "bento_version.upload_url_failed");
                Err(Error::UploadUrlIssuance { version_id: version.id, source: Box::new(e) })
            }
        }
    }

    /// Issue a new upload URL for a version whose upload has not finished.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn issue_upload_url(&self, version_id: i64) -> Result<PresignedUpload> {
        let version = self.store.get_version(version_id).await?;
        if version.upload_status.is_terminal() {
            return Err(Error::InvalidTransition { axis: "upload", from: version.upload_status.as_str(), to: UploadStatus::Uploading.as_str() });
        }
        let (bento, org) = self.owners(version.bento_id).await?;
        let target = org.storage_target()?;
        let upload = self.upload_url(&org, &bento, &version, &target).await.inspect_err(|_| UPLOAD_URL_FAILURES.inc())?;
        info!(version_id, key = %upload.storage_key, "bento_version.upload_url_reissued");
        Ok(upload)
    }

    async fn upload_url(&self, org: &Organization, bento: &Bento, version: &BentoVersion, target: &StorageTarget) -> Result<PresignedUpload> {
        self.objects.ensure_bucket(target).await?;
        let key = naming::s3_object_name(&org.name, &bento.name, &version.version);
        self.objects.presign_upload(target, &key, UPLOAD_URL_TTL).await
    }

    /// Apply `changes` to `version` and return the updated record.
    ///
    /// An empty change set returns the record untouched without a write. An
    /// upload moving to `success` provisions the image build; if that fails
    /// the status change stays committed and the provisioning error is returned.
    #[tracing::instrument(level = "info", skip(self, version, changes), fields(version_id = version.id))]
    pub async fn update(&self, mut version: BentoVersion, changes: BentoVersionChanges) -> Result<BentoVersion> {
        if changes.is_empty() { return Ok(version); }
        changes.validate(&version)?;
        self.store.update_version(version.id, &changes).await?;
        changes.apply_to(&mut version);
        version.updated_at = chrono::Utc::now();
        info!(build_status = %version.build_status, upload_status = %version.upload_status, "bento_version.updated");
        if changes.completes_upload() {
            let report = self.provision_build(&version).await?;
            info!(job = %report.job_name, created = report.created(), "bento_version.build_requested");
        }
        Ok(version)
    }

    /// Create the build namespace, credentials and kaniko job for `version`.
    ///
    /// All organization config is checked before the cluster is contacted.
    #[tracing::instrument(level = "info", skip(self, version), fields(version_id = version.id))]
    pub async fn provision_build(&self, version: &BentoVersion) -> Result<ProvisionReport> {
        let (bento, org) = self.owners(version.bento_id).await?;
        let target = org.storage_target()?;
        let registry = org.registry_uri()?;
        let spec = BuildSpec {
            namespace: self.build.namespace.clone(),
            job_name: naming::image_builder_job_name(&org.name, &bento.name, &version.version),
            builder_image: self.build.builder_image.clone(),
            object_name: naming::s3_object_name(&org.name, &bento.name, &version.version),
            image_name: naming::image_name(registry, &org.name, &bento.name, &version.version),
            bucket: target.bucket_name,
            region: target.region,
            access_key_id: target.access_key_id,
            secret_access_key: target.secret_access_key,
        };
        let cluster = self.store.get_major_cluster(&org).await?;
        let session = self.clusters.connect(&cluster).await?;
        builder::provision(session.as_ref(), &spec).await
    }

    pub async fn get(&self, id: i64) -> Result<BentoVersion> { self.store.get_version(id).await }

    pub async fn get_by_version(&self, bento_id: i64, version: &str) -> Result<BentoVersion> {
        self.store.get_version_by_name(bento_id, version).await
    }

    /// Newest `build_at` first, plus the total across all pages.
    pub async fn list(&self, bento_id: Option<i64>, limit: i64, offset: i64) -> Result<(Vec<BentoVersion>, i64)> {
        self.store.list_versions(bento_id, limit.max(0), offset.max(0)).await
    }

    pub async fn list_latest_by_bento_ids(&self, bento_ids: &[i64]) -> Result<Vec<BentoVersion>> {
        self.store.list_latest_by_bento_ids(bento_ids).await
    }

    /// Registry reference the build for `version` pushes to.
    pub async fn image_name(&self, version: &BentoVersion) -> Result<String> {
        let (bento, org) = self.owners(version.bento_id).await?;
        Ok(naming::image_name(org.registry_uri()?, &org.name, &bento.name, &version.version))
    }

    pub async fn image_builder_job_name(&self, version: &BentoVersion) -> Result<String> {
        let (bento, org) = self.owners(version.bento_id).await?;
        Ok(naming::image_builder_job_name(&org.name, &bento.name, &version.version))
    }
}
