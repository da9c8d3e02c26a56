//! Persistence boundary for bento versions and the records they hang off.
use async_trait::async_trait;
use sqlx::{Pool, Postgres, QueryBuilder};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Bento, BentoVersion, BentoVersionChanges, BuildStatus, Cluster, CreateBentoVersion, Organization, UploadStatus};

const VERSION_COLUMNS: &str = "id, bento_id, creator_id, version, description, build_status, upload_status, build_at, upload_started_at, upload_finished_at, upload_finished_reason, manifest, created_at, updated_at";

#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    /// Insert with both statuses `pending`. A duplicate (bento_id, version) is `Error::Conflict`.
    async fn insert_version(&self, new: &CreateBentoVersion) -> Result<BentoVersion>;
    /// Apply a non-empty change set to one row atomically.
    async fn update_version(&self, id: i64, changes: &BentoVersionChanges) -> Result<()>;
    async fn get_version(&self, id: i64) -> Result<BentoVersion>;
    async fn get_version_by_name(&self, bento_id: i64, version: &str) -> Result<BentoVersion>;
    /// Page of a bento's versions, newest `build_at` first, plus the unpaged total.
    async fn list_versions(&self, bento_id: Option<i64>, limit: i64, offset: i64) -> Result<(Vec<BentoVersion>, i64)>;
    /// The highest-id version of each listed bento.
    async fn list_latest_by_bento_ids(&self, bento_ids: &[i64]) -> Result<Vec<BentoVersion>>;
    async fn get_bento(&self, id: i64) -> Result<Bento>;
    async fn get_organization(&self, id: i64) -> Result<Organization>;
    /// The organization's build cluster: `major_cluster_name` if set, else its oldest cluster.
    async fn get_major_cluster(&self, org: &Organization) -> Result<Cluster>;
    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct PgVersionStore { pool: Pool<Postgres> }

impl PgVersionStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
}

fn found<T>(row: Option<T>, kind: &'static str, key: impl ToString) -> Result<T> {
    row.ok_or_else(|| Error::not_found(kind, key))
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn insert_version(&self, new: &CreateBentoVersion) -> Result<BentoVersion> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("INSERT INTO bento_versions (bento_id, creator_id, version, description, build_status, upload_status, build_at, manifest) VALUES ($1,$2,$3,$4,$5,$6,$7,$8) RETURNING {VERSION_COLUMNS}");
        let row = sqlx::query_as::<_, BentoVersion>(&sql)
            .bind(new.bento_id)
            .bind(new.creator_id)
            .bind(&new.version)
            .bind(&new.description)
            .bind(BuildStatus::Pending.as_str())
            .bind(UploadStatus::Pending.as_str())
            .bind(new.build_at)
            .bind(&new.manifest)
            .fetch_one(&mut *tx).await
            .map_err(|e| match Error::from(e) {
                Error::Conflict(_) => Error::Conflict(format!("bento {} already has version {}", new.bento_id, new.version)),
                other => other,
            })?;
        tx.commit().await?;
        Ok(row)
    }

    async fn update_version(&self, id: i64, changes: &BentoVersionChanges) -> Result<()> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE bento_versions SET updated_at = now()");
        if let Some(s) = changes.build_status { qb.push(", build_status = ").push_bind(s.as_str()); }
        if let Some(s) = changes.upload_status { qb.push(", upload_status = ").push_bind(s.as_str()); }
        if let Some(t) = changes.upload_started_at { qb.push(", upload_started_at = ").push_bind(t); }
        if let Some(t) = changes.upload_finished_at { qb.push(", upload_finished_at = ").push_bind(t); }
        if let Some(r) = &changes.upload_finished_reason { qb.push(", upload_finished_reason = ").push_bind(r.clone()); }
        qb.push(" WHERE id = ").push_bind(id);
        let mut tx = self.pool.begin().await?;
        let res = qb.build().execute(&mut *tx).await?;
        if res.rows_affected() == 0 { return Err(Error::not_found("bento version", id)); }
        tx.commit().await?;
        debug!(version_id=id, "store.version_updated");
        Ok(())
    }

    async fn get_version(&self, id: i64) -> Result<BentoVersion> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM bento_versions WHERE id = $1");
        let row = sqlx::query_as::<_, BentoVersion>(&sql).bind(id).fetch_optional(&self.pool).await?;
        found(row, "bento version", id)
    }

    async fn get_version_by_name(&self, bento_id: i64, version: &str) -> Result<BentoVersion> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM bento_versions WHERE bento_id = $1 AND version = $2");
        let row = sqlx::query_as::<_, BentoVersion>(&sql).bind(bento_id).bind(version).fetch_optional(&self.pool).await?;
        found(row, "bento version", format!("{bento_id}:{version}"))
    }

    async fn list_versions(&self, bento_id: Option<i64>, limit: i64, offset: i64) -> Result<(Vec<BentoVersion>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bento_versions WHERE ($1::BIGINT IS NULL OR bento_id = $1)")
            .bind(bento_id).fetch_one(&self.pool).await?;
        let sql = format!("SELECT {VERSION_COLUMNS} FROM bento_versions WHERE ($1::BIGINT IS NULL OR bento_id = $1) ORDER BY build_at DESC, id DESC LIMIT $2 OFFSET $3");
        let rows = sqlx::query_as::<_, BentoVersion>(&sql).bind(bento_id).bind(limit).bind(offset).fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    async fn list_latest_by_bento_ids(&self, bento_ids: &[i64]) -> Result<Vec<BentoVersion>> {
        if bento_ids.is_empty() { return Ok(Vec::new()); }
        let sql = format!("SELECT {VERSION_COLUMNS} FROM bento_versions WHERE id IN (SELECT MAX(id) FROM bento_versions WHERE bento_id = ANY($1) GROUP BY bento_id) ORDER BY bento_id");
        Ok(sqlx::query_as::<_, BentoVersion>(&sql).bind(bento_ids).fetch_all(&self.pool).await?)
    }

    async fn get_bento(&self, id: i64) -> Result<Bento> {
        let row = sqlx::query_as::<_, Bento>("SELECT id, organization_id, name FROM bentos WHERE id = $1")
            .bind(id).fetch_optional(&self.pool).await?;
        found(row, "bento", id)
    }

    async fn get_organization(&self, id: i64) -> Result<Organization> {
        let row = sqlx::query_as::<_, Organization>("SELECT id, name, config FROM organizations WHERE id = $1")
            .bind(id).fetch_optional(&self.pool).await?;
        found(row, "organization", id)
    }

    async fn get_major_cluster(&self, org: &Organization) -> Result<Cluster> {
        let row = match org.major_cluster_name() {
            Some(name) => sqlx::query_as::<_, Cluster>("SELECT id, organization_id, name, kube_config FROM clusters WHERE organization_id = $1 AND name = $2")
                .bind(org.id).bind(name).fetch_optional(&self.pool).await?,
            None => sqlx::query_as::<_, Cluster>("SELECT id, organization_id, name, kube_config FROM clusters WHERE organization_id = $1 ORDER BY id ASC LIMIT 1")
                .bind(org.id).fetch_optional(&self.pool).await?,
        };
        found(row, "cluster", format!("major cluster of organization {}", org.name))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
