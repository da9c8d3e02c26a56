//! Cluster access resolution.
//!
//! Turns a stored kubeconfig blob (or the ambient in-cluster identity when
//! none is stored) into a live `kube::Client`. Every resolution is fresh;
//! callers that want to reuse a client own that caching.
use std::sync::Once;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{client::ClientBuilder, Client, Config};
use tower::limit::RateLimitLayer;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::Cluster;

/// Client-side request budget applied to every resolved client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimits {
    /// Sustained requests per second.
    pub qps: f64,
    /// Requests admitted per refill window.
    pub burst: u64,
}

impl RateLimits {
    /// High enough to never throttle: the build cluster is a trusted backend.
    pub const UNTHROTTLED: RateLimits = RateLimits { qps: 1e6, burst: 1_000_000 };

    /// Longest refill window a budget can ask for.
    pub const MAX_WINDOW: Duration = Duration::from_secs(3600);

    /// Express the budget as `burst` requests per window of `burst / qps` seconds,
    /// capped at [`Self::MAX_WINDOW`].
    pub fn window(&self) -> (u64, Duration) {
        let burst = self.burst.max(1);
        let qps = if self.qps.is_finite() && self.qps > 0.0 { self.qps } else { Self::UNTHROTTLED.qps };
        let per = Duration::try_from_secs_f64(burst as f64 / qps).unwrap_or(Self::MAX_WINDOW);
        (burst, per.min(Self::MAX_WINDOW))
    }
}

impl Default for RateLimits {
    fn default() -> Self { Self::UNTHROTTLED }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterResolver { limits: RateLimits }

impl ClusterResolver {
    pub fn new(limits: RateLimits) -> Self { Self { limits } }

    pub fn limits(&self) -> RateLimits { self.limits }

    /// Resolve `cluster` into a client with no default namespace plus the config it was built from.
    pub async fn resolve(&self, cluster: &Cluster) -> Result<(Client, Config)> {
        let config = if cluster.kube_config.trim().is_empty() {
            ambient_config().await?
        } else {
            let kubeconfig = parse_kubeconfig(&cluster.kube_config)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Credential(format!("cluster {}: build client config: {e}", cluster.name)))?
        };
        let client = self.build_client(config.clone())?;
        info!(cluster=%cluster.name, server=%config.cluster_url, "cluster.client_resolved");
        Ok((client, config))
    }

    pub fn build_client(&self, config: Config) -> Result<Client> {
        install_crypto_provider();
        let (num, per) = self.limits.window();
        let builder = ClientBuilder::try_from(config).map_err(|e| Error::Credential(format!("build client: {e}")))?;
        Ok(builder.with_layer(&RateLimitLayer::new(num, per)).build())
    }
}

static CRYPTO_PROVIDER: Once = Once::new();

/// Pin the process-wide rustls provider. The dependency tree enables both
/// `ring` and `aws-lc-rs`, so rustls cannot pick one on its own.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
            debug!("cluster.crypto_provider_already_installed");
        }
    });
}

/// In-cluster service account first, then the local default kubeconfig.
async fn ambient_config() -> Result<Config> {
    match Config::incluster() {
        Ok(c) => Ok(c),
        Err(in_cluster) => {
            debug!(error=%in_cluster, "cluster.incluster_unavailable");
            Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Credential(format!("get in-cluster rest config: {in_cluster}; default kubeconfig: {e}")))
        }
    }
}

/// Parse a stored kubeconfig. Current records are YAML; legacy records were
/// stored as JSON. Both decode into the canonical `Kubeconfig`.
pub fn parse_kubeconfig(raw: &str) -> Result<Kubeconfig> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(k) = serde_json::from_str::<Kubeconfig>(trimmed) { return Ok(k); }
    }
    Kubeconfig::from_yaml(trimmed).map_err(|e| Error::Credential(format!("k8s cluster config yaml to json: {e}")))
}
