//! On-disk layout of collected artifacts
//!
//! ```text
//! <root>/
//!   <node>/kern.log, journal.log, <service>.log, <remote basename>
//!   cluster-info/
//!     <namespace>/<pod>/<container>.log
//!     <namespace>/<pod>/<container>.previous.log
//!     [<namespace>/]<group>.<resource>.{json,yaml}
//! ```
//!
//! Directories are created lazily, with mode `0755`, when the first file
//! beneath them is written. Existing files are truncated.

use crate::errors::ItemError;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Computes artifact paths beneath a root directory
#[derive(Clone, Debug)]
pub struct Layout {
    root: PathBuf,
}

/// Encodings supported for resource listings
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON (the default)
    #[default]
    Json,

    /// YAML, converted from the JSON encoding
    Yaml,
}

/// Indicates that an unsupported output format was specified
#[derive(Debug, thiserror::Error)]
#[error("invalid output format: {0} must be 'json' or 'yaml'")]
pub struct InvalidOutputFormat(String);

const CLUSTER_INFO: &str = "cluster-info";

const DIR_MODE: u32 = 0o755;

// === impl Layout ===

impl Layout {
    /// Creates a layout rooted at `root`
    ///
    /// The root directory is owned by the caller and is expected to exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the artifacts root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding a node's logs
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    /// Returns the path of a node log file named `file_name`
    pub fn node_log(&self, node: &str, file_name: &str) -> PathBuf {
        self.node_dir(node).join(file_name)
    }

    /// Returns the path of a container's log
    ///
    /// When `previous` is set, the path refers to the log of the container's
    /// prior instance.
    pub fn pod_log(&self, namespace: &str, pod: &str, container: &str, previous: bool) -> PathBuf {
        let file_name = if previous {
            format!("{container}.previous.log")
        } else {
            format!("{container}.log")
        };
        self.root
            .join(CLUSTER_INFO)
            .join(namespace)
            .join(pod)
            .join(file_name)
    }

    /// Returns the path of a resource listing
    ///
    /// Cluster-scoped listings are written directly under `cluster-info`. The
    /// file name is always `<group>.<resource>.<ext>`, so kinds in the core
    /// group produce names like `.secrets.json`.
    pub fn resource(
        &self,
        namespace: Option<&str>,
        group: &str,
        resource: &str,
        format: OutputFormat,
    ) -> PathBuf {
        let mut path = self.root.join(CLUSTER_INFO);
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            path.push(ns);
        }
        path.push(format!("{group}.{resource}.{}", format.extension()));
        path
    }
}

// === impl OutputFormat ===

impl OutputFormat {
    /// Returns the file extension used for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = InvalidOutputFormat;

    fn from_str(s: &str) -> Result<Self, InvalidOutputFormat> {
        match s {
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            s => Err(InvalidOutputFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

// === fs helpers ===

/// Creates the parent directories of `path`
///
/// Directories that already exist, including those created concurrently by
/// another worker, are not an error.
pub async fn create_parent(path: &Path) -> std::io::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).await
}

/// Creates `path` (and its parents), truncating any existing file
pub async fn create_file(path: &Path) -> Result<tokio::fs::File, ItemError> {
    create_parent(path)
        .await
        .map_err(|e| ItemError::io(path, e))?;
    tokio::fs::File::create(path)
        .await
        .map_err(|e| ItemError::io(path, e))
}

/// Writes `contents` to `path`, creating parents and truncating any existing
/// file
pub async fn write_file(path: &Path, contents: &[u8]) -> Result<(), ItemError> {
    let mut file = create_file(path).await?;
    file.write_all(contents)
        .await
        .map_err(|e| ItemError::io(path, e))?;
    file.flush().await.map_err(|e| ItemError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_paths() {
        let layout = Layout::new("/artifacts");
        assert_eq!(
            layout.node_log("n1", "kern.log"),
            PathBuf::from("/artifacts/n1/kern.log")
        );
        assert_eq!(
            layout.node_log("10.0.0.2", "kubelet.log"),
            PathBuf::from("/artifacts/10.0.0.2/kubelet.log")
        );
    }

    #[test]
    fn pod_paths() {
        let layout = Layout::new("/artifacts");
        assert_eq!(
            layout.pod_log("x", "p", "c", false),
            PathBuf::from("/artifacts/cluster-info/x/p/c.log")
        );
        assert_eq!(
            layout.pod_log("x", "p", "c", true),
            PathBuf::from("/artifacts/cluster-info/x/p/c.previous.log")
        );
    }

    #[test]
    fn resource_paths() {
        let layout = Layout::new("/artifacts");
        assert_eq!(
            layout.resource(Some("y"), "", "secrets", OutputFormat::Json),
            PathBuf::from("/artifacts/cluster-info/y/.secrets.json")
        );
        assert_eq!(
            layout.resource(Some("y"), "apps", "deployments", OutputFormat::Yaml),
            PathBuf::from("/artifacts/cluster-info/y/apps.deployments.yaml")
        );
        assert_eq!(
            layout.resource(
                None,
                "rbac.authorization.k8s.io",
                "clusterroles",
                OutputFormat::Json
            ),
            Path::new("/artifacts/cluster-info").join("rbac.authorization.k8s.io.clusterroles.json")
        );
    }

    #[test]
    fn parses_output_format() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("yaml".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[tokio::test]
    async fn writes_and_truncates() {
        let dir = tempfile::TempDir::with_prefix("kubedump-test").expect("tempdir");
        let path = dir.path().join("a").join("b").join("c.log");

        write_file(&path, b"first contents").await.expect("write");
        write_file(&path, b"second").await.expect("rewrite");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("a"))
                .expect("metadata")
                .permissions()
                .mode();
            // The process umask may only clear bits.
            assert_eq!(mode & 0o700, 0o700);
            assert_eq!(mode & !0o755 & 0o777, 0);
        }
    }

    #[tokio::test]
    async fn concurrent_parents_are_tolerated() {
        let dir = tempfile::TempDir::with_prefix("kubedump-test").expect("tempdir");
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let path = dir.path().join("shared").join(format!("{i}.log"));
            tasks.spawn(async move { write_file(&path, b"ok").await });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("task").expect("write");
        }
    }
}
