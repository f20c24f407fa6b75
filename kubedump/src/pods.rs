//! Collects container logs from the API server
//!
//! For every container of every pod, both the log of the current instance
//! and of the previous instance (if the container has restarted) are written
//! under `cluster-info/<namespace>/<pod>/`.

use crate::{
    api::PodLogs,
    artifacts::{self, Layout},
    errors::{status_code, Error, Errors, ItemError},
    pool,
};
use k8s_openapi::api::core::v1::Pod;
use kube_core::ResourceExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configures a [`PodLogDumper`]
#[derive(Clone, Debug)]
pub struct PodLogConfig {
    /// The number of pods processed concurrently
    pub concurrency: usize,
}

/// Dumps the logs of every container in the cluster
pub struct PodLogDumper<A> {
    api: Arc<A>,
    layout: Layout,
    config: PodLogConfig,
}

/// The containers of a pod, in the order their logs are fetched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadInstance {
    /// The pod's namespace
    pub namespace: String,

    /// The pod's name
    pub name: String,

    /// Init containers followed by app containers, in declared order
    pub containers: Vec<String>,
}

/// The API server reports a missing previous instance, or a container that
/// has not started, with this status.
const NO_SUCH_INSTANCE: u16 = 400;

// === impl PodLogConfig ===

impl Default for PodLogConfig {
    fn default() -> Self {
        Self {
            concurrency: pool::DEFAULT_CONCURRENCY,
        }
    }
}

// === impl WorkloadInstance ===

impl WorkloadInstance {
    /// Extracts the containers of `pod`
    pub fn from_pod(pod: &Pod) -> Self {
        let containers = pod
            .spec
            .iter()
            .flat_map(|spec| {
                spec.init_containers
                    .iter()
                    .flatten()
                    .chain(spec.containers.iter())
            })
            .map(|c| c.name.clone())
            .collect();
        Self {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
            containers,
        }
    }
}

// === impl PodLogDumper ===

impl<A: PodLogs> PodLogDumper<A> {
    /// Creates a dumper writing beneath `layout`
    pub fn new(api: Arc<A>, layout: Layout, config: PodLogConfig) -> Self {
        Self {
            api,
            layout,
            config,
        }
    }

    /// Writes the current and previous logs of every container in the cluster
    ///
    /// A fetch that fails with a 400 status (no previous instance, or the
    /// container is not running yet) is skipped. Other failures do not stop
    /// the remaining fetches and are returned together as
    /// [`Error::Items`].
    pub async fn dump_logs(&self, token: &CancellationToken) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let pods = match token.run_until_cancelled(self.api.list_pods()).await {
            None => return Err(Error::Cancelled),
            Some(res) => res.map_err(|source| Error::Setup {
                what: "pods",
                source,
            })?,
        };
        let instances = pods.iter().map(WorkloadInstance::from_pod).collect::<Vec<_>>();
        info!(pods = instances.len(), "Dumping pod logs");

        let work = {
            let api = self.api.clone();
            let layout = self.layout.clone();
            let token = token.clone();
            move |instance: WorkloadInstance| {
                let api = api.clone();
                let layout = layout.clone();
                let token = token.clone();
                async move { dump_instance(&*api, &layout, &token, &instance).await }
            }
        };
        let errors = pool::run(self.config.concurrency, instances, token, work).await;

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        errors.into_result().map_err(Error::Items)
    }
}

async fn dump_instance<A: PodLogs>(
    api: &A,
    layout: &Layout,
    token: &CancellationToken,
    instance: &WorkloadInstance,
) -> Errors {
    let mut errors = Errors::default();
    for container in &instance.containers {
        for previous in [true, false] {
            let res = dump_container_log(api, layout, token, instance, container, previous).await;
            if let Err(error) = res {
                errors.push(error);
            }
        }
    }
    errors
}

async fn dump_container_log<A: PodLogs>(
    api: &A,
    layout: &Layout,
    token: &CancellationToken,
    instance: &WorkloadInstance,
    container: &str,
    previous: bool,
) -> Result<(), ItemError> {
    let WorkloadInstance {
        namespace, name, ..
    } = instance;

    let path = layout.pod_log(namespace, name, container, previous);
    artifacts::create_parent(&path)
        .await
        .map_err(|e| ItemError::io(&path, e))?;

    let logs = api.logs(namespace, name, container, previous);
    let body = match token.run_until_cancelled(logs).await {
        None => return Err(ItemError::Cancelled),
        Some(Ok(body)) => body,
        Some(Err(error)) if status_code(&error) == Some(NO_SUCH_INSTANCE) => {
            debug!(%namespace, pod = %name, %container, previous, %error, "Log not available");
            return Ok(());
        }
        Some(Err(source)) => {
            let which = if previous { "previous logs" } else { "logs" };
            return Err(ItemError::Api {
                context: format!("failed to fetch {which} for {namespace}/{name}/{container}"),
                source,
            });
        }
    };

    artifacts::write_file(&path, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{Container, PodSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };
    use tempfile::TempDir;

    type Key = (String, String, String, bool);

    #[derive(Default)]
    struct MockLogs {
        pods: Vec<Pod>,
        responses: Mutex<HashMap<Key, Result<Vec<u8>, u16>>>,
        fetches: AtomicUsize,
        cancel_on_fetch: Option<CancellationToken>,
    }

    fn pod(ns: &str, name: &str, init: &[&str], containers: &[&str]) -> Pod {
        let container = |n: &&str| Container {
            name: n.to_string(),
            ..Default::default()
        };
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: if init.is_empty() {
                    None
                } else {
                    Some(init.iter().map(container).collect())
                },
                containers: containers.iter().map(container).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_error(code: u16) -> kube_client::Error {
        kube_client::Error::Api(kube_core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    impl MockLogs {
        fn respond(
            self,
            ns: &str,
            pod: &str,
            c: &str,
            previous: bool,
            rsp: Result<&str, u16>,
        ) -> Self {
            self.respond_bytes(ns, pod, c, previous, rsp.map(str::as_bytes))
        }

        fn respond_bytes(
            self,
            ns: &str,
            pod: &str,
            c: &str,
            previous: bool,
            rsp: Result<&[u8], u16>,
        ) -> Self {
            self.responses.lock().unwrap().insert(
                (ns.to_string(), pod.to_string(), c.to_string(), previous),
                rsp.map(<[u8]>::to_vec),
            );
            self
        }
    }

    #[async_trait::async_trait]
    impl PodLogs for MockLogs {
        async fn list_pods(&self) -> Result<Vec<Pod>, kube_client::Error> {
            Ok(self.pods.clone())
        }

        async fn logs(
            &self,
            namespace: &str,
            pod: &str,
            container: &str,
            previous: bool,
        ) -> Result<Vec<u8>, kube_client::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = self.cancel_on_fetch.as_ref() {
                token.cancel();
            }
            let key = (
                namespace.to_string(),
                pod.to_string(),
                container.to_string(),
                previous,
            );
            match self.responses.lock().unwrap().get(&key) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(code)) => Err(api_error(*code)),
                None => Err(api_error(NO_SUCH_INSTANCE)),
            }
        }
    }

    fn dumper(api: MockLogs) -> (TempDir, PodLogDumper<MockLogs>) {
        let dir = TempDir::with_prefix("kubedump-test").expect("tempdir");
        let dumper = PodLogDumper::new(
            Arc::new(api),
            Layout::new(dir.path()),
            PodLogConfig::default(),
        );
        (dir, dumper)
    }

    #[test]
    fn init_containers_first() {
        let instance = WorkloadInstance::from_pod(&pod("x", "p", &["init"], &["a", "b"]));
        assert_eq!(instance.namespace, "x");
        assert_eq!(instance.name, "p");
        assert_eq!(instance.containers, vec!["init", "a", "b"]);
    }

    #[tokio::test]
    async fn previous_instance_absent() {
        let api = MockLogs {
            pods: vec![pod("x", "p", &[], &["c"])],
            ..Default::default()
        }
        .respond("x", "p", "c", true, Err(400))
        .respond("x", "p", "c", false, Ok("hello"));
        let (dir, dumper) = dumper(api);

        dumper
            .dump_logs(&CancellationToken::new())
            .await
            .expect("dump must succeed");

        let pod_dir = dir.path().join("cluster-info").join("x").join("p");
        assert_eq!(
            std::fs::read_to_string(pod_dir.join("c.log")).expect("c.log"),
            "hello"
        );
        assert!(!pod_dir.join("c.previous.log").exists());
    }

    #[tokio::test]
    async fn current_instance_forbidden() {
        let api = MockLogs {
            pods: vec![pod("x", "p", &[], &["c"])],
            ..Default::default()
        }
        .respond("x", "p", "c", true, Ok("old"))
        .respond("x", "p", "c", false, Err(401));
        let (dir, dumper) = dumper(api);

        let err = dumper
            .dump_logs(&CancellationToken::new())
            .await
            .expect_err("dump must fail");
        let Error::Items(errors) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors.to_string().contains("x/p"), "{errors}");

        let pod_dir = dir.path().join("cluster-info").join("x").join("p");
        assert_eq!(
            std::fs::read_to_string(pod_dir.join("c.previous.log")).expect("c.previous.log"),
            "old"
        );
        assert!(!pod_dir.join("c.log").exists());
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_containers() {
        let api = MockLogs {
            pods: vec![pod("x", "p", &["setup"], &["a", "b"])],
            ..Default::default()
        }
        .respond("x", "p", "setup", false, Ok("init"))
        .respond("x", "p", "a", true, Err(500))
        .respond("x", "p", "a", false, Err(503))
        .respond("x", "p", "b", false, Ok("bee"));
        let (dir, dumper) = dumper(api);

        let err = dumper
            .dump_logs(&CancellationToken::new())
            .await
            .expect_err("dump must fail");
        let Error::Items(errors) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(errors.len(), 2);

        let pod_dir = dir.path().join("cluster-info").join("x").join("p");
        assert_eq!(std::fs::read_to_string(pod_dir.join("setup.log")).unwrap(), "init");
        assert_eq!(std::fs::read_to_string(pod_dir.join("b.log")).unwrap(), "bee");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_pods() {
        let pods = (0..75)
            .map(|i| pod(&format!("ns{}", i % 4), &format!("p{i}"), &[], &["c"]))
            .collect::<Vec<_>>();
        let mut api = MockLogs {
            pods,
            ..Default::default()
        };
        for i in 0..75 {
            api = api.respond(&format!("ns{}", i % 4), &format!("p{i}"), "c", false, Ok("ok"));
        }
        let (dir, dumper) = dumper(api);

        dumper
            .dump_logs(&CancellationToken::new())
            .await
            .expect("dump must succeed");
        assert_eq!(dumper.api.fetches.load(Ordering::SeqCst), 150);
        for i in 0..75 {
            let path = dir
                .path()
                .join("cluster-info")
                .join(format!("ns{}", i % 4))
                .join(format!("p{i}"))
                .join("c.log");
            assert!(path.exists(), "{}", path.display());
        }
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let api = MockLogs {
            pods: vec![pod("x", "p", &[], &["c"])],
            ..Default::default()
        }
        .respond("x", "p", "c", false, Ok("hello"));
        let (dir, dumper) = dumper(api);

        let token = CancellationToken::new();
        token.cancel();
        let err = dumper.dump_logs(&token).await.expect_err("must be cancelled");
        assert!(matches!(err, Error::Cancelled), "{err}");
        assert_eq!(dumper.api.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn writes_non_utf8_logs() {
        let api = MockLogs {
            pods: vec![pod("x", "p", &[], &["c"])],
            ..Default::default()
        }
        .respond_bytes("x", "p", "c", false, Ok(b"ok\xff\xfe\n"));
        let (dir, dumper) = dumper(api);

        dumper
            .dump_logs(&CancellationToken::new())
            .await
            .expect("dump must succeed");

        let path = dir.path().join("cluster-info/x/p/c.log");
        assert_eq!(std::fs::read(path).expect("c.log"), b"ok\xff\xfe\n");
    }

    #[tokio::test]
    async fn cancelled_while_fetching() {
        let token = CancellationToken::new();
        let mut api = MockLogs {
            pods: (0..3).map(|i| pod("x", &format!("p{i}"), &[], &["c"])).collect(),
            cancel_on_fetch: Some(token.clone()),
            ..Default::default()
        };
        for i in 0..3 {
            api = api.respond("x", &format!("p{i}"), "c", false, Ok("ok"));
        }
        let dir = TempDir::with_prefix("kubedump-test").expect("tempdir");
        let dumper = PodLogDumper::new(
            Arc::new(api),
            Layout::new(dir.path()),
            PodLogConfig { concurrency: 1 },
        );

        let err = dumper.dump_logs(&token).await.expect_err("must be cancelled");
        assert!(matches!(err, Error::Cancelled), "{err}");
        // Only the first fetch is issued; the remaining containers and pods are skipped.
        assert_eq!(dumper.api.fetches.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("cluster-info/x/p1").exists());
    }
}
