//! Kubernetes client construction

use kube_client::config::{
    Config, InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError,
};
use std::path::PathBuf;

pub use kube_client::Client;

mod ratelimit;

pub use self::ratelimit::{RateLimit, RateLimitLayer};

/// The default sustained rate of API requests per second
pub const DEFAULT_QPS: u32 = 50;

/// The default number of API requests that may be issued in a burst
pub const DEFAULT_BURST: u32 = 100;

/// Configures the Kubernetes client
#[derive(Clone, Debug)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct ClientArgs {
    /// The kubeconfig file to use
    ///
    /// When unset, the configuration is inferred from the environment.
    #[cfg_attr(feature = "cli", clap(long))]
    pub kubeconfig: Option<PathBuf>,

    /// The kubeconfig context to use
    #[cfg_attr(feature = "cli", clap(long))]
    pub context: Option<String>,

    /// The sustained rate of API requests per second (0 disables the limit)
    #[cfg_attr(feature = "cli", clap(long = "kube-api-qps", default_value_t = DEFAULT_QPS))]
    pub qps: u32,

    /// The number of API requests that may be issued in a burst
    #[cfg_attr(feature = "cli", clap(long = "kube-api-burst", default_value_t = DEFAULT_BURST))]
    pub burst: u32,
}

/// Indicates that a client could not be configured
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The kubeconfig could not be loaded
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    /// No configuration could be inferred from the environment
    #[error(transparent)]
    Infer(#[from] InferConfigError),

    /// The client could not be built from the configuration
    #[error("failed to build client: {0}")]
    Client(#[from] kube_client::Error),
}

// === impl ClientArgs ===

impl Default for ClientArgs {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl ClientArgs {
    /// Loads the client configuration
    ///
    /// An explicit kubeconfig file or context takes precedence; otherwise the
    /// configuration is inferred from `$KUBECONFIG`, the default kubeconfig,
    /// or the in-cluster environment.
    pub async fn load_config(&self) -> Result<Config, ConfigError> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };
        let config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await?
            }
            None if self.context.is_some() => Config::from_kubeconfig(&options).await?,
            None => Config::infer().await?,
        };
        Ok(config)
    }

    /// Builds a client whose requests are rate limited as configured
    pub async fn try_client(self) -> Result<Client, ConfigError> {
        let config = self.load_config().await?;
        tracing::debug!(
            url = %config.cluster_url,
            qps = self.qps,
            burst = self.burst,
            "Building client"
        );
        let client = kube_client::client::ClientBuilder::try_from(config)?
            .with_layer(&RateLimitLayer::new(self.qps, self.burst))
            .build();
        Ok(client)
    }
}
