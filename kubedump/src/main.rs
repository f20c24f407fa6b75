#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube_client::core::Duration as KubeDuration;
use kubedump::{
    api::NodeLister,
    discovery::DEFAULT_IGNORED_RESOURCES,
    log::LogArgs,
    nodes::{DEFAULT_FILES, DEFAULT_LOG_DIR, DEFAULT_SERVICES},
    shutdown::{self, Completion},
    ssh::{SshConfig, SshDialer, DEFAULT_PORT},
    ClientArgs, Error, KubeApi, Layout, NodeDumpConfig, NodeDumper, OutputFormat, PodLogConfig,
    PodLogDumper, ResourceDumpConfig, ResourceDumper,
};
use std::{future::Future, path::PathBuf, sync::Arc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Parser)]
#[clap(version, about)]
struct Args {
    #[clap(flatten)]
    log: LogArgs,

    #[clap(flatten)]
    client: ClientArgs,

    /// The directory into which artifacts are written
    #[clap(long, env = "ARTIFACTS")]
    artifacts: PathBuf,

    /// A systemd service whose journal is captured from each node
    #[clap(long = "service", default_values_t = DEFAULT_SERVICES.map(String::from))]
    services: Vec<String>,

    /// A log file, by base name, captured from each node's log directory
    #[clap(long = "file", default_values_t = DEFAULT_FILES.map(String::from))]
    files: Vec<String>,

    /// The system log directory on each node
    #[clap(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: String,

    /// A resource, by plural name, that is not dumped
    #[clap(
        long = "ignore-resource",
        default_values_t = DEFAULT_IGNORED_RESOURCES.map(String::from)
    )]
    ignored_resources: Vec<String>,

    /// The encoding of resource listings: json or yaml
    #[clap(long, default_value = "json")]
    output: OutputFormat,

    /// The number of pods whose logs are fetched concurrently
    #[clap(long, default_value_t = PodLogConfig::default().concurrency)]
    pod_log_concurrency: usize,

    /// The number of resource listings fetched concurrently
    #[clap(long, default_value_t = ResourceDumpConfig::default().concurrency)]
    resource_dump_concurrency: usize,

    /// The user to log into nodes as; nodes are only dumped when this is set
    #[clap(long)]
    ssh_user: Option<String>,

    /// A private key used to log into nodes; the SSH agent is used otherwise
    #[clap(long)]
    ssh_key: Option<PathBuf>,

    /// The SSH port on each node
    #[clap(long, default_value_t = DEFAULT_PORT)]
    ssh_port: u16,

    /// An address of an instance that may not be registered as a node
    #[clap(long = "additional-host")]
    additional_hosts: Vec<String>,

    /// Cancels collection after this amount of time
    #[clap(long)]
    timeout: Option<Timeout>,

    /// Skips dumping node logs
    #[clap(long)]
    skip_nodes: bool,

    /// Skips dumping container logs
    #[clap(long)]
    skip_pods: bool,

    /// Skips dumping resources
    #[clap(long)]
    skip_resources: bool,
}

#[derive(Copy, Clone, Debug)]
struct Timeout(time::Duration);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.log.try_init()?;

    let token = CancellationToken::new();
    let shutdown = shutdown::register(token.clone())?;
    tokio::spawn(async move {
        if shutdown.on_signal().await == Completion::Aborted {
            error!("Aborted");
            std::process::exit(1);
        }
    });
    if let Some(Timeout(timeout)) = args.timeout {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(timeout) => {
                    warn!(?timeout, "Deadline exceeded; cancelling");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    tokio::fs::create_dir_all(&args.artifacts)
        .await
        .with_context(|| format!("failed to create {}", args.artifacts.display()))?;
    let layout = Layout::new(&args.artifacts);

    let client = args
        .client
        .clone()
        .try_client()
        .await
        .context("failed to build Kubernetes client")?;
    let api = Arc::new(KubeApi::new(client));

    let mut failed = false;

    if !args.skip_resources {
        let config = ResourceDumpConfig {
            format: args.output,
            ignored: args.ignored_resources.iter().cloned().collect(),
            concurrency: args.resource_dump_concurrency,
        };
        let dumper = ResourceDumper::new(api.clone(), layout.clone(), config);
        failed |= report("resources", dumper.dump_resources(&token)).await?;
    }

    if !args.skip_pods {
        let config = PodLogConfig {
            concurrency: args.pod_log_concurrency,
        };
        let dumper = PodLogDumper::new(api.clone(), layout.clone(), config);
        failed |= report("pod logs", dumper.dump_logs(&token)).await?;
    }

    if !args.skip_nodes {
        if args.ssh_user.is_some() {
            failed |= report("node logs", dump_nodes(&args, &api, layout, &token)).await?;
        } else {
            info!("No SSH user configured; skipping node logs");
        }
    }

    if failed {
        bail!("one or more collectors failed");
    }
    info!(artifacts = %args.artifacts.display(), "Done");
    Ok(())
}

async fn dump_nodes(
    args: &Args,
    api: &KubeApi,
    layout: Layout,
    token: &CancellationToken,
) -> Result<(), Error> {
    let Some(user) = args.ssh_user.clone() else {
        return Ok(());
    };

    // Nodes that never registered may still be reachable as additional hosts.
    let nodes = match token.run_until_cancelled(api.list_nodes()).await {
        None => return Err(Error::Cancelled),
        Some(Ok(nodes)) => nodes,
        Some(Err(error)) => {
            warn!(%error, "Failed to list nodes");
            Vec::new()
        }
    };

    let dialer = SshDialer::new(SshConfig {
        user,
        identity: args.ssh_key.clone(),
        port: args.ssh_port,
    });
    let config = NodeDumpConfig {
        services: args.services.clone(),
        files: args.files.clone(),
        log_dir: args.log_dir.clone(),
    };
    NodeDumper::new(dialer, layout, config)
        .dump_all_nodes(token, &nodes, &args.additional_hosts)
        .await
}

/// Logs the outcome of a collector, returning true if it failed
///
/// Cancellation ends the run.
async fn report(what: &'static str, dump: impl Future<Output = Result<(), Error>>) -> Result<bool> {
    info!("Dumping {what}");
    match dump.await {
        Ok(()) => Ok(false),
        Err(Error::Cancelled) => bail!("cancelled while dumping {what}"),
        Err(Error::Items(errors)) => {
            for error in errors.iter() {
                warn!(%error, "Failed to dump {what}");
            }
            error!(failures = errors.len(), "Failed to dump {what}");
            Ok(true)
        }
        Err(error) => {
            error!(%error, "Failed to dump {what}");
            Ok(true)
        }
    }
}

// === impl Timeout ===

impl std::str::FromStr for Timeout {
    type Err = <KubeDuration as std::str::FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<KubeDuration>()?.into()))
    }
}
