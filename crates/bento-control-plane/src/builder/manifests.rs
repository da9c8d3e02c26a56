//! Kubernetes objects submitted for one image build.
use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Namespace, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub const AWS_SECRET_NAME: &str = "aws-secret";
pub const AWS_SECRET_KEY: &str = "credentials";
pub const DOCKER_CONFIG_NAME: &str = "docker-config";
pub const DOCKER_CONFIG_KEY: &str = "config.json";
/// Registry credential helper kaniko uses to push to ECR.
pub const REGISTRY_CREDS_STORE: &str = "ecr-login";
pub const DOCKER_CONFIG_MOUNT: &str = "/kaniko/.docker/";
pub const AWS_SECRET_MOUNT: &str = "/root/.aws/";
pub const BUILDER_CONTAINER: &str = "builder";

const MANAGED_BY: &str = "bento-control-plane";

/// Everything needed to render the build resources for one bento version.
#[derive(Clone, PartialEq)]
pub struct BuildSpec {
    pub namespace: String,
    pub job_name: String,
    pub builder_image: String,
    pub bucket: String,
    pub object_name: String,
    pub image_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for BuildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildSpec")
            .field("namespace", &self.namespace)
            .field("job_name", &self.job_name)
            .field("context", &self.context_uri())
            .field("destination", &self.image_name)
            .finish_non_exhaustive()
    }
}

impl BuildSpec {
    pub fn context_uri(&self) -> String { format!("s3://{}/{}", self.bucket, self.object_name) }
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string())])),
        ..Default::default()
    }
}

pub fn namespace(name: &str) -> Namespace {
    Namespace { metadata: meta(name, None), ..Default::default() }
}

/// AWS shared-credentials file for kaniko's S3 context fetch and ECR push.
pub fn render_aws_credentials(access_key_id: &str, secret_access_key: &str) -> String {
    format!("[default]\naws_access_key_id = {access_key_id}\naws_secret_access_key = {secret_access_key}\n")
}

pub fn aws_secret(spec: &BuildSpec) -> Secret {
    Secret {
        metadata: meta(AWS_SECRET_NAME, Some(&spec.namespace)),
        string_data: Some(BTreeMap::from([(
            AWS_SECRET_KEY.to_string(),
            render_aws_credentials(&spec.access_key_id, &spec.secret_access_key),
        )])),
        ..Default::default()
    }
}

pub fn docker_config(spec: &BuildSpec) -> ConfigMap {
    let content = serde_json::json!({ "credsStore": REGISTRY_CREDS_STORE }).to_string();
    ConfigMap {
        metadata: meta(DOCKER_CONFIG_NAME, Some(&spec.namespace)),
        data: Some(BTreeMap::from([(DOCKER_CONFIG_KEY.to_string(), content)])),
        ..Default::default()
    }
}

/// Run-once kaniko job. Neither the pod nor the job retries on failure.
pub fn image_builder_job(spec: &BuildSpec) -> Job {
    let container = Container {
        name: BUILDER_CONTAINER.to_string(),
        image: Some(spec.builder_image.clone()),
        args: Some(vec![
            "--dockerfile=./Dockerfile".to_string(),
            format!("--context={}", spec.context_uri()),
            format!("--destination={}", spec.image_name),
        ]),
        volume_mounts: Some(vec![
            VolumeMount { name: DOCKER_CONFIG_NAME.to_string(), mount_path: DOCKER_CONFIG_MOUNT.to_string(), ..Default::default() },
            VolumeMount { name: AWS_SECRET_NAME.to_string(), mount_path: AWS_SECRET_MOUNT.to_string(), ..Default::default() },
        ]),
        env: Some(vec![EnvVar { name: "AWS_REGION".to_string(), value: Some(spec.region.clone()), ..Default::default() }]),
        ..Default::default()
    };
    let volumes = vec![
        Volume {
            name: DOCKER_CONFIG_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource { name: Some(DOCKER_CONFIG_NAME.to_string()), ..Default::default() }),
            ..Default::default()
        },
        Volume {
            name: AWS_SECRET_NAME.to_string(),
            secret: Some(SecretVolumeSource { secret_name: Some(AWS_SECRET_NAME.to_string()), ..Default::default() }),
            ..Default::default()
        },
    ];
    Job {
        metadata: meta(&spec.job_name, Some(&spec.namespace)),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(meta(&spec.job_name, None)),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
