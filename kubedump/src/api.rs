//! Cluster API capabilities consumed by the collectors
//!
//! Each collector depends only on the narrow capabilities it uses so that it
//! can be driven by an in-memory implementation in tests. [`KubeApi`]
//! implements all of them on top of a [`kube_client::Client`]. The client
//! must be safe to share between workers, as `kube_client::Client` is.

use crate::discovery::{self, DiscoveryError, ResourceKind};
use http_body_util::BodyExt;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube_client::{
    api::{Api, DynamicObject, ListParams, LogParams},
    client::Body,
    Client,
};
use kube_core::{ErrorResponse, Resource, ResourceExt};

/// Lists cluster nodes
#[async_trait::async_trait]
pub trait NodeLister: Send + Sync + 'static {
    /// Lists all nodes in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, kube_client::Error>;
}

/// Lists pods and fetches container logs
#[async_trait::async_trait]
pub trait PodLogs: Send + Sync + 'static {
    /// Lists pods in all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>, kube_client::Error>;

    /// Fetches the log of a container
    ///
    /// When `previous` is set, the log of the container's prior instance is
    /// returned. The API responds with a 400 status when no such instance
    /// exists. The body is returned as sent; it need not be UTF-8.
    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<Vec<u8>, kube_client::Error>;
}

/// Lists namespace names
#[async_trait::async_trait]
pub trait NamespaceLister: Send + Sync + 'static {
    /// Lists the names of all namespaces
    async fn list_namespaces(&self) -> Result<Vec<String>, kube_client::Error>;
}

/// Discovers served resource kinds
#[async_trait::async_trait]
pub trait ResourceDiscovery: Send + Sync + 'static {
    /// Returns each API group's resource kinds at the group's preferred
    /// version
    async fn preferred_resources(&self) -> Result<Vec<ResourceKind>, DiscoveryError>;
}

/// Lists arbitrary resources
#[async_trait::async_trait]
pub trait DynamicList: Send + Sync + 'static {
    /// Lists all objects of `kind`, in `namespace` if one is given
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube_client::Error>;
}

/// Implements the collectors' API capabilities with a Kubernetes client
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

// === impl KubeApi ===

impl KubeApi {
    /// Wraps a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Returns the underlying client
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl NodeLister for KubeApi {
    async fn list_nodes(&self) -> Result<Vec<Node>, kube_client::Error> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(nodes.items)
    }
}

#[async_trait::async_trait]
impl PodLogs for KubeApi {
    async fn list_pods(&self) -> Result<Vec<Pod>, kube_client::Error> {
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(pods.items)
    }

    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        previous: bool,
    ) -> Result<Vec<u8>, kube_client::Error> {
        let params = LogParams {
            container: Some(container.to_string()),
            previous,
            ..Default::default()
        };
        // The typed log helpers decode the body as UTF-8, so the request is
        // issued directly and the raw body returned.
        let request = kube_core::Request::new(Pod::url_path(&(), Some(namespace)))
            .logs(pod, &params)
            .map_err(kube_client::Error::BuildRequest)?;
        let rsp = self.client.send(request.map(Body::from)).await?;
        let status = rsp.status();
        let body = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| kube_client::Error::Service(e.into()))?
            .to_bytes();

        if status.is_client_error() || status.is_server_error() {
            let error = serde_json::from_slice::<ErrorResponse>(&body).unwrap_or_else(|_| {
                ErrorResponse {
                    status: status.to_string(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                    reason: "Failed to parse error data".to_string(),
                    code: status.as_u16(),
                }
            });
            return Err(kube_client::Error::Api(error));
        }
        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl NamespaceLister for KubeApi {
    async fn list_namespaces(&self) -> Result<Vec<String>, kube_client::Error> {
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;
        Ok(namespaces
            .items
            .iter()
            .map(|ns| ns.name_any())
            .collect())
    }
}

#[async_trait::async_trait]
impl ResourceDiscovery for KubeApi {
    async fn preferred_resources(&self) -> Result<Vec<ResourceKind>, DiscoveryError> {
        discovery::preferred_resources(&self.client).await
    }
}

#[async_trait::async_trait]
impl DynamicList for KubeApi {
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, kube_client::Error> {
        let resource = kind.api_resource();
        let api = match namespace {
            Some(ns) => Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::<DynamicObject>::all_with(self.client.clone(), &resource),
        };
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test]
    async fn logs_are_returned_undecoded() {
        let svc = tower::service_fn(|req: hyper::Request<Body>| async move {
            assert_eq!(req.uri().path(), "/api/v1/namespaces/x/pods/p/log");
            let query = req.uri().query().unwrap_or_default();
            assert!(query.contains("container=c"), "{query}");
            assert!(query.contains("previous=true"), "{query}");
            Ok::<_, Infallible>(hyper::Response::new(Body::from(b"ok\xff\n".to_vec())))
        });
        let api = KubeApi::new(Client::new(svc, "default"));

        let body = api.logs("x", "p", "c", true).await.expect("logs");
        assert_eq!(body, b"ok\xff\n");
    }

    fn respond_with(status: hyper::StatusCode, body: Vec<u8>) -> Client {
        let svc = tower::service_fn(move |_: hyper::Request<Body>| {
            let mut rsp = hyper::Response::new(Body::from(body.clone()));
            *rsp.status_mut() = status;
            async move { Ok::<_, Infallible>(rsp) }
        });
        Client::new(svc, "default")
    }

    #[tokio::test]
    async fn log_errors_carry_status() {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "previous terminated container \"c\" in pod \"p\" not found",
            "reason": "BadRequest",
            "code": 400,
        });
        let client = respond_with(
            hyper::StatusCode::BAD_REQUEST,
            serde_json::to_vec(&status).unwrap(),
        );

        let err = KubeApi::new(client)
            .logs("x", "p", "c", true)
            .await
            .expect_err("must fail");
        assert_eq!(crate::errors::status_code(&err), Some(400), "{err}");
    }

    #[tokio::test]
    async fn log_errors_without_status_body() {
        let client = respond_with(
            hyper::StatusCode::SERVICE_UNAVAILABLE,
            b"upstream unavailable".to_vec(),
        );

        let err = KubeApi::new(client)
            .logs("x", "p", "c", false)
            .await
            .expect_err("must fail");
        assert_eq!(crate::errors::status_code(&err), Some(503), "{err}");
    }
}
