//! Image build provisioning.
//!
//! A build is a short pipeline of idempotent steps run against the
//! organization's build cluster: namespace, credentials secret, registry
//! config, then the kaniko job itself. Each step reports whether it created
//! its resource or found it already there; the first failure stops the
//! pipeline.
pub mod kube_cluster;
pub mod manifests;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::telemetry::BUILD_PROVISION_TOTAL;
pub use kube_cluster::KubeBuildCluster;
pub use manifests::BuildSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind { Namespace, Secret, ConfigMap, Job }

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self { Self::Namespace => "namespace", Self::Secret => "secret", Self::ConfigMap => "configmap", Self::Job => "job" }
    }
}

/// A cluster object the pipeline may create.
#[derive(Debug, Clone)]
pub enum BuildResource { Namespace(Namespace), Secret(Secret), ConfigMap(ConfigMap), Job(Job) }

impl BuildResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::Secret(_) => ResourceKind::Secret,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Job(_) => ResourceKind::Job,
        }
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self { Self::Namespace(o) => &o.metadata, Self::Secret(o) => &o.metadata, Self::ConfigMap(o) => &o.metadata, Self::Job(o) => &o.metadata }
    }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or_default() }

    /// `None` for cluster-scoped objects.
    pub fn namespace(&self) -> Option<&str> { self.meta().namespace.as_deref() }

    pub fn describe(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}/{}", self.kind().as_str(), ns, self.name()),
            None => format!("{}/{}", self.kind().as_str(), self.name()),
        }
    }
}

/// The slice of the cluster API the provisioner needs.
#[async_trait]
pub trait BuildCluster: Send + Sync {
    async fn exists(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<bool>;
    /// Create `resource`. An existing object with the same name must surface as `Error::AlreadyExists`.
    async fn create(&self, resource: &BuildResource) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus { Created, AlreadyPresent }

#[derive(Debug)]
pub enum StepOutcome { Created, AlreadyPresent, Failed(Error) }

#[async_trait]
pub trait ProvisionStep: Send + Sync {
    fn describe(&self) -> String;
    async fn run(&self, cluster: &dyn BuildCluster) -> StepOutcome;
}

fn creation_outcome(result: Result<()>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Created,
        // lost a race with a concurrent provisioning of the same version
        Err(e) if e.is_already_exists() => StepOutcome::AlreadyPresent,
        Err(e) => StepOutcome::Failed(e),
    }
}

/// Look the resource up by name and create it only when missing.
pub struct EnsureResource(pub BuildResource);

#[async_trait]
impl ProvisionStep for EnsureResource {
    fn describe(&self) -> String { self.0.describe() }

    async fn run(&self, cluster: &dyn BuildCluster) -> StepOutcome {
        match cluster.exists(self.0.kind(), self.0.namespace(), self.0.name()).await {
            Ok(true) => StepOutcome::AlreadyPresent,
            Ok(false) => creation_outcome(cluster.create(&self.0).await),
            Err(e) => StepOutcome::Failed(e),
        }
    }
}

/// Submit the build job. Jobs are never looked up first: a job with the
/// same derived name means this version's build was already submitted.
pub struct SubmitJob(pub Job);

#[async_trait]
impl ProvisionStep for SubmitJob {
    fn describe(&self) -> String { BuildResource::Job(self.0.clone()).describe() }

    async fn run(&self, cluster: &dyn BuildCluster) -> StepOutcome {
        creation_outcome(cluster.create(&BuildResource::Job(self.0.clone())).await)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord { pub step: String, pub status: StepStatus }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport { pub job_name: String, pub steps: Vec<StepRecord> }

impl ProvisionReport {
    pub fn created(&self) -> usize { self.steps.iter().filter(|s| s.status == StepStatus::Created).count() }
    pub fn job_submitted(&self) -> bool { self.steps.last().is_some_and(|s| s.step.starts_with("job/") && s.status == StepStatus::Created) }
}

#[derive(Default)]
pub struct Pipeline { steps: Vec<Box<dyn ProvisionStep>> }

impl Pipeline {
    pub fn new() -> Self { Self::default() }

    pub fn step(mut self, step: impl ProvisionStep + 'static) -> Self { self.steps.push(Box::new(step)); self }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self, cluster: &dyn BuildCluster) -> Result<Vec<StepRecord>> {
        let mut done = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let name = step.describe();
            let status = match step.run(cluster).await {
                StepOutcome::Created => StepStatus::Created,
                StepOutcome::AlreadyPresent => StepStatus::AlreadyPresent,
                StepOutcome::Failed(e) => {
                    warn!(step=%name, completed=done.len(), error=%e, "build.step_failed");
                    return Err(e);
                }
            };
            info!(step=%name, status=?status, "build.step");
            done.push(StepRecord { step: name, status });
        }
        Ok(done)
    }
}

/// The standard build pipeline for one bento version.
pub fn build_pipeline(spec: &BuildSpec) -> Pipeline {
    Pipeline::new()
        .step(EnsureResource(BuildResource::Namespace(manifests::namespace(&spec.namespace))))
        .step(EnsureResource(BuildResource::Secret(manifests::aws_secret(spec))))
        .step(EnsureResource(BuildResource::ConfigMap(manifests::docker_config(spec))))
        .step(SubmitJob(manifests::image_builder_job(spec)))
}

/// Provision the build resources for `spec`. Returns once the job is accepted;
/// completion is observed elsewhere.
#[tracing::instrument(level="info", skip(cluster, spec), fields(job=%spec.job_name, namespace=%spec.namespace))]
pub async fn provision(cluster: &dyn BuildCluster, spec: &BuildSpec) -> Result<ProvisionReport> {
    match build_pipeline(spec).run(cluster).await {
        Ok(steps) => {
            let report = ProvisionReport { job_name: spec.job_name.clone(), steps };
            let outcome = if report.job_submitted() { "submitted" } else { "already_submitted" };
            BUILD_PROVISION_TOTAL.with_label_values(&[outcome]).inc();
            info!(created=report.created(), outcome, "build.provisioned");
            Ok(report)
        }
        Err(e) => {
            BUILD_PROVISION_TOTAL.with_label_values(&["failed"]).inc();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryCluster;

    fn spec() -> BuildSpec {
        BuildSpec {
            namespace: "yatai-builders".into(),
            job_name: "yatai-image-builder-acme-resnet-1-0-0".into(),
            builder_image: "kaniko:test".into(),
            bucket: "acme-bentos".into(),
            object_name: "bentos/acme/resnet/1.0.0.tar.gz".into(),
            image_name: "registry/acme:yatai.acme.resnet.1.0.0".into(),
            region: "us-west-2".into(),
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
        }
    }

    #[tokio::test]
    async fn first_run_creates_everything() {
        let cluster = InMemoryCluster::default();
        let report = provision(&cluster, &spec()).await.unwrap();
        assert_eq!(report.created(), 4);
        assert!(report.job_submitted());
        assert_eq!(report.steps[0].step, "namespace/yatai-builders");
        assert_eq!(report.steps[3].step, "job/yatai-builders/yatai-image-builder-acme-resnet-1-0-0");
        assert_eq!(cluster.count(ResourceKind::Job), 1);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let cluster = InMemoryCluster::default();
        provision(&cluster, &spec()).await.unwrap();
        let again = provision(&cluster, &spec()).await.unwrap();
        assert_eq!(again.created(), 0);
        assert!(again.steps.iter().all(|s| s.status == StepStatus::AlreadyPresent));
        assert!(!again.job_submitted());
        assert_eq!(cluster.count(ResourceKind::Job), 1);
        assert_eq!(cluster.count(ResourceKind::Namespace), 1);
    }

    #[tokio::test]
    async fn create_race_is_tolerated() {
        // existence check says "missing" but the create hits 409
        let cluster = InMemoryCluster::default();
        cluster.hide_from_lookups(ResourceKind::Secret);
        provision(&cluster, &spec()).await.unwrap();
        let report = provision(&cluster, &spec()).await.unwrap();
        let secret = report.steps.iter().find(|s| s.step.starts_with("secret/")).unwrap();
        assert_eq!(secret.status, StepStatus::AlreadyPresent);
    }

    #[tokio::test]
    async fn failure_stops_the_pipeline() {
        let cluster = InMemoryCluster::default();
        cluster.fail_creates(ResourceKind::Secret);
        let err = provision(&cluster, &spec()).await.unwrap_err();
        assert!(matches!(err, Error::Cluster { .. } | Error::Credential(_)), "{err:?}");
        assert_eq!(cluster.count(ResourceKind::Namespace), 1);
        assert_eq!(cluster.count(ResourceKind::ConfigMap), 0);
        assert_eq!(cluster.count(ResourceKind::Job), 0);
    }

    #[test]
    fn pipeline_order() {
        let p = build_pipeline(&spec());
        assert_eq!(p.steps.len(), 4);
        let names: Vec<_> = p.steps.iter().map(|s| s.describe()).collect();
        assert_eq!(names, vec![
            "namespace/yatai-builders",
            "secret/yatai-builders/aws-secret",
            "configmap/yatai-builders/docker-config",
            "job/yatai-builders/yatai-image-builder-acme-resnet-1-0-0",
        ]);
    }
}
