//! Test harness utilities for unit and integration tests.
//! In-memory stand-ins for the version store, the object store and the build
//! cluster, a ready-wired `Fixture`, and an optional Postgres pool for the
//! store tests.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};

use crate::builder::{BuildCluster, BuildResource, ResourceKind};
use crate::config::BuildSettings;
use crate::engine::{BentoVersionService, ClusterConnector};
use crate::error::{Error, Result};
use crate::models::{
    AwsConfig, Bento, BentoVersion, BentoVersionChanges, BuildStatus, Cluster, CreateBentoVersion, EcrConfig,
    Organization, OrganizationConfig, S3Config, StorageTarget, UploadStatus,
};
use crate::storage::{endpoint_of, BucketState, ObjectStoreGateway, PresignedUpload};
use crate::store::VersionStore;
use crate::AppState;

static TEST_DB_URL_ENV: &str = "DATABASE_URL";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse { status: "Failure".into(), message: message.into(), reason: reason.into(), code })
}

/// Complete organization config: static credentials, S3 bucket and ECR registry.
pub fn acme_config() -> OrganizationConfig {
    OrganizationConfig {
        aws: Some(AwsConfig {
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "s3cr3t".into(),
            s3: Some(S3Config { bucket_name: "acme-bentos".into(), region: "us-west-2".into(), endpoint: None }),
            ecr: Some(EcrConfig { repository_uri: "123456789012.dkr.ecr.us-west-2.amazonaws.com/acme".into() }),
        }),
        major_cluster_name: None,
    }
}

pub fn new_version(bento_id: i64, version: &str) -> CreateBentoVersion {
    CreateBentoVersion {
        creator_id: 1,
        bento_id,
        version: version.into(),
        description: String::new(),
        build_at: Utc::now(),
        manifest: None,
    }
}

/// Build cluster kept in memory. Creates of an existing name fail with 409 like the API server.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<Vec<BuildResource>>,
    hidden: Mutex<HashSet<ResourceKind>>,
    failing: Mutex<HashSet<ResourceKind>>,
}

impl InMemoryCluster {
    pub fn count(&self, kind: ResourceKind) -> usize { lock(&self.objects).iter().filter(|o| o.kind() == kind).count() }

    pub fn total(&self) -> usize { lock(&self.objects).len() }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<BuildResource> {
        lock(&self.objects).iter().find(|o| o.kind() == kind && o.name() == name).cloned()
    }

    /// Lookups of `kind` report "missing" even when the object exists.
    pub fn hide_from_lookups(&self, kind: ResourceKind) { lock(&self.hidden).insert(kind); }

    /// Creates of `kind` fail with a server error.
    pub fn fail_creates(&self, kind: ResourceKind) { lock(&self.failing).insert(kind); }

    fn contains(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> bool {
        lock(&self.objects).iter().any(|o| o.kind() == kind && o.namespace() == namespace && o.name() == name)
    }
}

#[async_trait]
impl BuildCluster for InMemoryCluster {
    async fn exists(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool> {
        if lock(&self.hidden).contains(&kind) { return Ok(false); }
        Ok(self.contains(kind, namespace, name))
    }

    async fn create(&self, resource: &BuildResource) -> Result<()> {
        let kind = resource.kind();
        if lock(&self.failing).contains(&kind) {
            return Err(Error::cluster("create", kind.as_str(), resource.name(), api_error(500, "InternalError", "injected failure")));
        }
        if self.contains(kind, resource.namespace(), resource.name()) {
            return Err(Error::cluster("create", kind.as_str(), resource.name(), api_error(409, "AlreadyExists", "already exists")));
        }
        lock(&self.objects).push(resource.clone());
        Ok(())
    }
}

/// Hands out the same in-memory cluster for every registered cluster.
pub struct StaticConnector { cluster: Arc<InMemoryCluster>, connects: AtomicUsize }

impl StaticConnector {
    pub fn new(cluster: Arc<InMemoryCluster>) -> Self { Self { cluster, connects: AtomicUsize::new(0) } }
    pub fn connects(&self) -> usize { self.connects.load(Ordering::SeqCst) }
}

#[async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, _cluster: &Cluster) -> Result<Arc<dyn BuildCluster>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster.clone())
    }
}

/// Object store that signs nothing: URLs are deterministic strings.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashSet<String>>,
    presigned: AtomicUsize,
    fail_presign: AtomicBool,
}

impl MemoryObjectStore {
    pub fn set_fail_presign(&self, fail: bool) { self.fail_presign.store(fail, Ordering::SeqCst); }
    pub fn presigned(&self) -> usize { self.presigned.load(Ordering::SeqCst) }
    pub fn has_bucket(&self, name: &str) -> bool { lock(&self.buckets).contains(name) }
}

#[async_trait]
impl ObjectStoreGateway for MemoryObjectStore {
    async fn ensure_bucket(&self, target: &StorageTarget) -> Result<BucketState> {
        if lock(&self.buckets).insert(target.bucket_name.clone()) { Ok(BucketState::Created) } else { Ok(BucketState::AlreadyOwned) }
    }

    async fn presign_upload(&self, target: &StorageTarget, key: &str, expires: Duration) -> Result<PresignedUpload> {
        if self.fail_presign.load(Ordering::SeqCst) { return Err(Error::object_store("presign", "injected failure")); }
        self.presigned.fetch_add(1, Ordering::SeqCst);
        Ok(PresignedUpload {
            url: format!("{}/{}/{}?X-Amz-Expires={}", endpoint_of(target), target.bucket_name, key, expires.as_secs()),
            method: "PUT".into(),
            headers: Default::default(),
            storage_key: key.to_string(),
        })
    }
}

#[derive(Default)]
struct Tables {
    organizations: Vec<Organization>,
    bentos: Vec<Bento>,
    clusters: Vec<Cluster>,
    versions: Vec<BentoVersion>,
}

/// `VersionStore` over plain vectors with the same uniqueness and ordering rules as Postgres.
#[derive(Default)]
pub struct MemoryVersionStore { tables: Mutex<Tables>, writes: AtomicUsize, fail_writes: AtomicBool }

impl MemoryVersionStore {
    /// Number of version inserts and updates performed.
    pub fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }

    /// Make version inserts and updates fail as if the pool were unavailable.
    pub fn fail_writes(&self, fail: bool) { self.fail_writes.store(fail, Ordering::SeqCst); }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) { return Err(Error::Database(sqlx::Error::PoolTimedOut)); }
        Ok(())
    }

    pub fn add_organization(&self, name: &str, config: Option<OrganizationConfig>) -> Organization {
        let mut t = lock(&self.tables);
        let org = Organization { id: t.organizations.len() as i64 + 1, name: name.into(), config: config.map(sqlx::types::Json) };
        t.organizations.push(org.clone());
        org
    }

    pub fn set_organization_config(&self, org_id: i64, config: Option<OrganizationConfig>) {
        if let Some(org) = lock(&self.tables).organizations.iter_mut().find(|o| o.id == org_id) {
            org.config = config.map(sqlx::types::Json);
        }
    }

    pub fn add_bento(&self, organization_id: i64, name: &str) -> Bento {
        let mut t = lock(&self.tables);
        let bento = Bento { id: t.bentos.len() as i64 + 1, organization_id, name: name.into() };
        t.bentos.push(bento.clone());
        bento
    }

    pub fn add_cluster(&self, organization_id: i64, name: &str) -> Cluster {
        let mut t = lock(&self.tables);
        let cluster = Cluster { id: t.clusters.len() as i64 + 1, organization_id, name: name.into(), kube_config: String::new() };
        t.clusters.push(cluster.clone());
        cluster
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn insert_version(&self, new: &CreateBentoVersion) -> Result<BentoVersion> {
        self.check_writable()?;
        let mut t = lock(&self.tables);
        if t.versions.iter().any(|v| v.bento_id == new.bento_id && v.version == new.version) {
            return Err(Error::Conflict(format!("bento {} already has version {}", new.bento_id, new.version)));
        }
        let now = Utc::now();
        let row = BentoVersion {
            id: t.versions.iter().map(|v| v.id).max().unwrap_or(0) + 1,
            bento_id: new.bento_id,
            creator_id: new.creator_id,
            version: new.version.clone(),
            description: new.description.clone(),
            build_status: BuildStatus::Pending,
            upload_status: UploadStatus::Pending,
            build_at: new.build_at,
            upload_started_at: None,
            upload_finished_at: None,
            upload_finished_reason: None,
            manifest: new.manifest.clone(),
            created_at: now,
            updated_at: now,
        };
        t.versions.push(row.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(row)
    }

    async fn update_version(&self, id: i64, changes: &BentoVersionChanges) -> Result<()> {
        self.check_writable()?;
        let mut t = lock(&self.tables);
        let row = t.versions.iter_mut().find(|v| v.id == id).ok_or_else(|| Error::not_found("bento version", id))?;
        changes.apply_to(row);
        row.updated_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_version(&self, id: i64) -> Result<BentoVersion> {
        lock(&self.tables).versions.iter().find(|v| v.id == id).cloned().ok_or_else(|| Error::not_found("bento version", id))
    }

    async fn get_version_by_name(&self, bento_id: i64, version: &str) -> Result<BentoVersion> {
        lock(&self.tables).versions.iter()
            .find(|v| v.bento_id == bento_id && v.version == version)
            .cloned()
            .ok_or_else(|| Error::not_found("bento version", format!("{bento_id}:{version}")))
    }

    async fn list_versions(&self, bento_id: Option<i64>, limit: i64, offset: i64) -> Result<(Vec<BentoVersion>, i64)> {
        let mut rows: Vec<_> = lock(&self.tables).versions.iter().filter(|v| bento_id.map_or(true, |b| v.bento_id == b)).cloned().collect();
        rows.sort_by(|a, b| b.build_at.cmp(&a.build_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        let page = rows.into_iter().skip(offset.max(0) as usize).take(limit.max(0) as usize).collect();
        Ok((page, total))
    }

    async fn list_latest_by_bento_ids(&self, bento_ids: &[i64]) -> Result<Vec<BentoVersion>> {
        let t = lock(&self.tables);
        let mut latest: Vec<BentoVersion> = Vec::new();
        for v in t.versions.iter().filter(|v| bento_ids.contains(&v.bento_id)) {
            match latest.iter_mut().find(|l| l.bento_id == v.bento_id) {
                Some(l) if l.id < v.id => *l = v.clone(),
                Some(_) => {}
                None => latest.push(v.clone()),
            }
        }
        latest.sort_by_key(|v| v.bento_id);
        Ok(latest)
    }

    async fn get_bento(&self, id: i64) -> Result<Bento> {
        lock(&self.tables).bentos.iter().find(|b| b.id == id).cloned().ok_or_else(|| Error::not_found("bento", id))
    }

    async fn get_organization(&self, id: i64) -> Result<Organization> {
        lock(&self.tables).organizations.iter().find(|o| o.id == id).cloned().ok_or_else(|| Error::not_found("organization", id))
    }

    async fn get_major_cluster(&self, org: &Organization) -> Result<Cluster> {
        let t = lock(&self.tables);
        let mut owned = t.clusters.iter().filter(|c| c.organization_id == org.id);
        let found = match org.major_cluster_name() {
            Some(name) => owned.find(|c| c.name == name),
            None => owned.min_by_key(|c| c.id),
        };
        found.cloned().ok_or_else(|| Error::not_found("cluster", format!("major cluster of organization {}", org.name)))
    }

    async fn ping(&self) -> Result<()> { Ok(()) }
}

/// The service wired to in-memory collaborators, seeded with organization
/// `acme` (complete config), bento `resnet` and one cluster.
pub struct Fixture {
    pub store: Arc<MemoryVersionStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub cluster: Arc<InMemoryCluster>,
    pub connector: Arc<StaticConnector>,
    pub service: BentoVersionService,
    pub org: Organization,
    pub bento: Bento,
}

impl Fixture {
    pub fn new() -> Self { Self::with_config(Some(acme_config())) }

    pub fn with_config(config: Option<OrganizationConfig>) -> Self {
        let store = Arc::new(MemoryVersionStore::default());
        let org = store.add_organization("acme", config);
        let bento = store.add_bento(org.id, "resnet");
        store.add_cluster(org.id, "default");
        let objects = Arc::new(MemoryObjectStore::default());
        let cluster = Arc::new(InMemoryCluster::default());
        let connector = Arc::new(StaticConnector::new(cluster.clone()));
        let service = BentoVersionService::new(store.clone(), objects.clone(), connector.clone(), BuildSettings::default());
        Self { store, objects, cluster, connector, service, org, bento }
    }

    pub fn state(&self) -> AppState { AppState { engine: self.service.clone() } }
}

impl Default for Fixture {
    fn default() -> Self { Self::new() }
}

/// Postgres pool for store tests, migrated and emptied. `None` when `DATABASE_URL` is unset.
pub async fn test_pool() -> Option<Pool<Postgres>> {
    let url = std::env::var(TEST_DB_URL_ENV).ok()?;
    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(8))
        .connect(&url)
        .await
    {
        Ok(p) => p,
        Err(e) => { eprintln!("[test_pool] connect failed: {e}"); return None; }
    };
    if let Err(e) = sqlx::migrate!().run(&pool).await { eprintln!("[test_pool] migrations failed: {e}"); return None; }
    for table in ["bento_versions", "clusters", "bentos", "organizations"] {
        let _ = sqlx::query(&format!("DELETE FROM {table}")).execute(&pool).await;
    }
    Some(pool)
}
