//! Collects system logs from nodes over a remote shell
//!
//! Each node is dumped sequentially on a single session: the kernel log, the
//! full journal, the journals of well-known services that are installed, and
//! well-known log files (including rotated copies) beneath the node's log
//! directory. Once a session is established, individual capture failures are
//! logged and never fail the node.

use crate::{
    artifacts::{self, Layout},
    errors::{Error, Errors, ItemError},
    ssh::{Dial, RemoteShell, ShellError},
};
use k8s_openapi::api::core::v1::Node;
use kube_core::ResourceExt;
use std::{collections::HashSet, path::Path};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configures which logs are captured from each node
#[derive(Clone, Debug)]
pub struct NodeDumpConfig {
    /// Systemd services whose journals are captured, if the unit exists
    pub services: Vec<String>,

    /// Base names of log files captured from [`NodeDumpConfig::log_dir`]
    ///
    /// A name `n` matches every path starting with `<log_dir>/n.log`, so
    /// rotated files are captured as well.
    pub files: Vec<String>,

    /// The remote system log directory
    pub log_dir: String,
}

/// Dumps node logs into per-node directories
pub struct NodeDumper<D> {
    dialer: D,
    layout: Layout,
    config: NodeDumpConfig,
}

/// The default set of services whose journals are captured
pub const DEFAULT_SERVICES: [&str; 5] = [
    "node-problem-detector",
    "kubelet",
    "docker",
    "kops-configuration",
    "protokube",
];

/// The default set of log files captured from the log directory
pub const DEFAULT_FILES: [&str; 16] = [
    "kube-apiserver",
    "kube-scheduler",
    "rescheduler",
    "kube-controller-manager",
    "etcd",
    "etcd-events",
    "glbc",
    "cluster-autoscaler",
    "kube-addon-manager",
    "fluentd",
    "kube-proxy",
    "node-problem-detector",
    "cloud-init-output",
    "startupscript",
    "kern",
    "docker",
];

/// The default remote log directory
pub const DEFAULT_LOG_DIR: &str = "/var/log";

const EXTERNAL_IP: &str = "ExternalIP";

// === impl NodeDumpConfig ===

impl Default for NodeDumpConfig {
    fn default() -> Self {
        Self {
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            files: DEFAULT_FILES.iter().map(|s| s.to_string()).collect(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
        }
    }
}

// === impl NodeDumper ===

impl<D: Dial> NodeDumper<D> {
    /// Creates a dumper writing beneath `layout`
    pub fn new(dialer: D, layout: Layout, config: NodeDumpConfig) -> Self {
        Self {
            dialer,
            layout,
            config,
        }
    }

    /// Dumps every node, followed by each additional host that does not
    /// match an address of a node that was dumped
    ///
    /// Registered nodes are dialed on their first external address and
    /// written to a directory named for the node. Additional hosts are
    /// written to a directory named for the address. Failures to dump a node
    /// are logged; only cancellation is returned.
    pub async fn dump_all_nodes(
        &self,
        token: &CancellationToken,
        nodes: &[Node],
        additional_hosts: &[String],
    ) -> Result<(), Error> {
        let mut dumped = Vec::new();
        for node in nodes {
            if token.is_cancelled() {
                info!("Stopping node dump due to cancellation");
                return Err(Error::Cancelled);
            }

            let name = node.name_any();
            let Some(host) = external_address(node) else {
                warn!(node = %name, "Could not find an external address");
                continue;
            };
            match self.dump_node(token, &name, host).await {
                Ok(()) => dumped.push(node),
                Err(error) => warn!(node = %name, %host, %error, "Could not dump node"),
            }
        }

        for host in undumped_hosts(additional_hosts, &dumped) {
            if token.is_cancelled() {
                info!("Stopping node dump due to cancellation");
                return Err(Error::Cancelled);
            }

            info!(%host, "Dumping node not registered in the cluster");
            if let Err(error) = self.dump_node(token, host, host).await {
                warn!(%host, %error, "Could not dump node");
            }
        }

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Connects to `host` and captures its logs into the directory for `name`
    ///
    /// Only a failure to connect is returned.
    async fn dump_node(
        &self,
        token: &CancellationToken,
        name: &str,
        host: &str,
    ) -> Result<(), Error> {
        info!(node = %name, %host, "Dumping node");
        let mut session = self
            .dialer
            .dial(token, host)
            .await
            .map_err(|source| Error::Connect {
                host: host.to_string(),
                source,
            })?;

        let mut script = Script {
            session: &mut session,
            token,
            layout: &self.layout,
            config: &self.config,
            node: name,
        };
        for error in script.run().await {
            warn!(node = %name, %error, "Failed to capture node log");
        }

        if let Err(error) = session.close().await {
            warn!(node = %name, %error, "Failed to close session");
        }
        Ok(())
    }
}

/// Returns the node's first external address
fn external_address(node: &Node) -> Option<&str> {
    let addr = node
        .status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == EXTERNAL_IP)?;
    Some(addr.address.as_str()).filter(|a| !a.is_empty())
}

/// Returns the hosts that do not match any address of a dumped node
fn undumped_hosts<'h>(hosts: &'h [String], dumped: &[&Node]) -> Vec<&'h str> {
    let addresses = dumped
        .iter()
        .filter_map(|n| n.status.as_ref()?.addresses.as_ref())
        .flatten()
        .map(|a| a.address.as_str())
        .collect::<HashSet<_>>();
    hosts
        .iter()
        .map(String::as_str)
        .filter(|h| !addresses.contains(h))
        .collect()
}

/// The capture script run on a single node's session
struct Script<'a, S> {
    session: &'a mut S,
    token: &'a CancellationToken,
    layout: &'a Layout,
    config: &'a NodeDumpConfig,
    node: &'a str,
}

impl<S: RemoteShell> Script<'_, S> {
    async fn run(&mut self) -> Errors {
        let config = self.config;
        let mut errors = Errors::default();
        if self.token.is_cancelled() {
            errors.push(ItemError::Cancelled);
            return errors;
        }

        if let Err(e) = self
            .shell_to_file("sudo journalctl --output=short-precise -k", "kern.log")
            .await
        {
            errors.push(e);
        }

        // The full journal duplicates the per-service logs but also captures
        // boot, disk and mount messages.
        if let Err(e) = self
            .shell_to_file("sudo journalctl --output=short-precise", "journal.log")
            .await
        {
            errors.push(e);
        }

        let units = match self.list_units().await {
            Ok(units) => units,
            Err(e) => {
                errors.push(e);
                HashSet::new()
            }
        };
        for service in &config.services {
            let unit = format!("{service}.service");
            if !units.contains(&unit) {
                continue;
            }
            let cmd = format!("sudo journalctl --output=cat -u {unit}");
            if let Err(e) = self.shell_to_file(&cmd, &format!("{service}.log")).await {
                errors.push(e);
            }
        }

        let log_dir = config.log_dir.trim_end_matches('/');
        let paths = match self.find_files(log_dir).await {
            Ok(paths) => paths,
            Err(e) => {
                errors.push(e);
                Vec::new()
            }
        };
        for name in &config.files {
            let prefix = format!("{log_dir}/{name}.log");
            for path in paths.iter().filter(|p| p.starts_with(&prefix)) {
                let Some(file_name) = Path::new(path).file_name().and_then(|f| f.to_str()) else {
                    continue;
                };
                let cmd = format!("sudo cat {path}");
                if let Err(e) = self.shell_to_file(&cmd, file_name).await {
                    errors.push(e);
                }
            }
        }

        errors
    }

    /// Runs `command`, writing both of its output streams to `file_name` in
    /// the node's directory
    async fn shell_to_file(&mut self, command: &str, file_name: &str) -> Result<(), ItemError> {
        let path = self.layout.node_log(self.node, file_name);
        if let Err(error) = artifacts::create_parent(&path).await {
            warn!(
                node = %self.node,
                path = %path.display(),
                %error,
                "Failed to create node directory"
            );
        }
        let mut stdout = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ItemError::io(&path, e))?;
        let mut stderr = stdout
            .try_clone()
            .await
            .map_err(|e| ItemError::io(&path, e))?;

        debug!(node = %self.node, %command, "Capturing");
        let res = self
            .session
            .exec_piped(self.token, command, &mut stdout, &mut stderr)
            .await;
        // Output captured before a failure is kept.
        let flushed = async {
            stdout.flush().await?;
            stderr.flush().await
        }
        .await;
        res?;
        flushed.map_err(|e| ItemError::io(&path, e))
    }

    /// Runs `command`, returning its standard output
    async fn output(&mut self, command: &str) -> Result<Vec<u8>, ShellError> {
        let mut stdout = Vec::new();
        let mut stderr = tokio::io::sink();
        self.session
            .exec_piped(self.token, command, &mut stdout, &mut stderr)
            .await?;
        Ok(stdout)
    }

    async fn list_units(&mut self) -> Result<HashSet<String>, ItemError> {
        let out = self
            .output("sudo systemctl list-units -t service --no-pager --no-legend --all")
            .await?;
        Ok(parse_units(&String::from_utf8_lossy(&out)))
    }

    async fn find_files(&mut self, dir: &str) -> Result<Vec<String>, ItemError> {
        let out = self.output(&format!("sudo find {dir} -print0")).await?;
        Ok(parse_paths(&out))
    }
}

/// Parses the first column of `systemctl list-units` output
fn parse_units(out: &str) -> HashSet<String> {
    out.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Splits NUL-delimited `find -print0` output
fn parse_paths(out: &[u8]) -> Vec<String> {
    out.split(|b| *b == 0)
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}
