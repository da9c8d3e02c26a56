//! Postgres-backed store tests. Skipped when DATABASE_URL is unset.
use bento_control_plane::error::Error;
use bento_control_plane::models::{BentoVersionChanges, UploadStatus};
use bento_control_plane::store::{PgVersionStore, VersionStore};
use bento_control_plane::test_support::{acme_config, new_version, test_pool};
use serial_test::serial;
use sqlx::{Pool, Postgres};

async fn seed(pool: &Pool<Postgres>) -> (i64, i64) {
    let org: i64 = sqlx::query_scalar("INSERT INTO organizations (name, config) VALUES ('acme', $1) RETURNING id")
        .bind(sqlx::types::Json(acme_config())).fetch_one(pool).await.unwrap();
    let bento: i64 = sqlx::query_scalar("INSERT INTO bentos (organization_id, name) VALUES ($1, 'resnet') RETURNING id")
        .bind(org).fetch_one(pool).await.unwrap();
    (org, bento)
}

#[tokio::test]
#[serial]
async fn insert_update_and_read_back() {
    let Some(pool) = test_pool().await else { eprintln!("skipping insert_update_and_read_back: DATABASE_URL not set"); return; };
    let (_, bento) = seed(&pool).await;
    let store = PgVersionStore::new(pool);

    let v = store.insert_version(&new_version(bento, "1.0.0")).await.unwrap();
    assert_eq!(v.upload_status, UploadStatus::Pending);
    let dup = store.insert_version(&new_version(bento, "1.0.0")).await.unwrap_err();
    assert!(matches!(dup, Error::Conflict(_)), "{dup:?}");

    let changes = BentoVersionChanges {
        upload_status: Some(UploadStatus::Success),
        upload_finished_at: Some(Some(chrono::Utc::now())),
        upload_finished_reason: Some("done".into()),
        ..Default::default()
    };
    store.update_version(v.id, &changes).await.unwrap();
    let back = store.get_version_by_name(bento, "1.0.0").await.unwrap();
    assert_eq!(back.upload_status, UploadStatus::Success);
    assert_eq!(back.upload_finished_reason.as_deref(), Some("done"));
    assert!(back.upload_finished_at.is_some());

    let missing = store.update_version(v.id + 1000, &changes).await.unwrap_err();
    assert!(missing.is_not_found());
}

#[tokio::test]
#[serial]
async fn latest_and_major_cluster() {
    let Some(pool) = test_pool().await else { eprintln!("skipping latest_and_major_cluster: DATABASE_URL not set"); return; };
    let (org_id, bento) = seed(&pool).await;
    sqlx::query("INSERT INTO clusters (organization_id, name) VALUES ($1, 'first'), ($1, 'second')")
        .bind(org_id).execute(&pool).await.unwrap();
    let store = PgVersionStore::new(pool);
    for v in ["1.0.0", "0.1.0"] { store.insert_version(&new_version(bento, v)).await.unwrap(); }

    let latest = store.list_latest_by_bento_ids(&[bento]).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, "0.1.0");
    let (items, total) = store.list_versions(Some(bento), 10, 0).await.unwrap();
    assert_eq!((items.len(), total), (2, 2));

    let org = store.get_organization(org_id).await.unwrap();
    assert_eq!(store.get_major_cluster(&org).await.unwrap().name, "first");
    store.ping().await.unwrap();
}
