//! Collects the state of every listable resource in the cluster
//!
//! Resource kinds are discovered at each API group's preferred version and
//! listed in every namespace (or once, for cluster-scoped kinds). Listings are
//! written as a single list document per kind and namespace, with managed
//! fields removed and secret values replaced.

use crate::{
    api::{DynamicList, NamespaceLister, ResourceDiscovery},
    artifacts::{self, Layout, OutputFormat},
    discovery::{DiscoveryError, KindScope, ResourceKind, DEFAULT_IGNORED_RESOURCES},
    errors::{status_code, Error, Errors, ItemError},
    pool,
};
use kube_client::api::DynamicObject;
use kube_core::TypeMeta;
use std::{collections::BTreeSet, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configures a [`ResourceDumper`]
#[derive(Clone, Debug)]
pub struct ResourceDumpConfig {
    /// The encoding of written listings
    pub format: OutputFormat,

    /// Plural resource names that are never dumped
    pub ignored: BTreeSet<String>,

    /// The number of listings processed concurrently
    pub concurrency: usize,
}

/// Dumps every listable resource kind in every namespace
pub struct ResourceDumper<A> {
    api: Arc<A>,
    layout: Layout,
    config: ResourceDumpConfig,
}

/// The value written in place of each secret's data
pub const REDACTED: &str = "REDACTED";

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ListDocument<'a> {
    api_version: String,
    kind: String,
    items: &'a [DynamicObject],
}

// === impl ResourceDumpConfig ===

impl Default for ResourceDumpConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            ignored: DEFAULT_IGNORED_RESOURCES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            concurrency: pool::DEFAULT_CONCURRENCY,
        }
    }
}

// === impl ResourceDumper ===

impl<A> ResourceDumper<A>
where
    A: NamespaceLister + ResourceDiscovery + DynamicList,
{
    /// Creates a dumper writing beneath `layout`
    pub fn new(api: Arc<A>, layout: Layout, config: ResourceDumpConfig) -> Self {
        Self {
            api,
            layout,
            config,
        }
    }

    /// Lists and writes every eligible resource kind
    ///
    /// Groups that fail discovery are logged and skipped. A listing that
    /// fails with a 4xx status (the kind is forbidden or unsupported in a
    /// namespace) is skipped. Other failures do not stop the remaining
    /// listings and are returned together as [`Error::Items`].
    pub async fn dump_resources(&self, token: &CancellationToken) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let namespaces = match token.run_until_cancelled(self.api.list_namespaces()).await {
            None => return Err(Error::Cancelled),
            Some(res) => res.map_err(|source| Error::Setup {
                what: "namespaces",
                source,
            })?,
        };

        let kinds = match token.run_until_cancelled(self.api.preferred_resources()).await {
            None => return Err(Error::Cancelled),
            Some(Ok(kinds)) => kinds,
            Some(Err(DiscoveryError::Partial { kinds, failed })) => {
                for (group_version, error) in failed {
                    warn!(%group_version, %error, "Failed to discover API group");
                }
                kinds
            }
            Some(Err(DiscoveryError::Failed(error))) => return Err(Error::Discovery(error)),
        };

        let scopes = KindScope::expand(&kinds, &namespaces, &self.config.ignored);
        info!(
            namespaces = namespaces.len(),
            kinds = kinds.len(),
            listings = scopes.len(),
            "Dumping resources"
        );

        let work = {
            let api = self.api.clone();
            let layout = self.layout.clone();
            let format = self.config.format;
            let token = token.clone();
            move |scope: KindScope| {
                let api = api.clone();
                let layout = layout.clone();
                let token = token.clone();
                async move {
                    match dump_scope(&*api, &layout, format, &token, &scope).await {
                        Ok(()) => Errors::default(),
                        Err(error) => Errors::from(error),
                    }
                }
            }
        };
        let errors = pool::run(self.config.concurrency, scopes, token, work).await;

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        errors.into_result().map_err(Error::Items)
    }
}

async fn dump_scope<A: DynamicList>(
    api: &A,
    layout: &Layout,
    format: OutputFormat,
    token: &CancellationToken,
    scope: &KindScope,
) -> Result<(), ItemError> {
    let KindScope { kind, namespace } = scope;

    let list = api.list(kind, namespace.as_deref());
    let mut items = match token.run_until_cancelled(list).await {
        None => return Err(ItemError::Cancelled),
        Some(Ok(items)) => items,
        Some(Err(error)) if status_code(&error).is_some_and(|c| (400..500).contains(&c)) => {
            debug!(%scope, %error, "Skipping resource");
            return Ok(());
        }
        Some(Err(source)) => {
            return Err(ItemError::Api {
                context: format!("failed to list {scope}"),
                source,
            })
        }
    };

    // Items in a list response omit their type.
    for item in &mut items {
        item.types.get_or_insert_with(|| TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });
        redact(kind, item);
    }
    let bytes = encode(scope, &items, format)?;

    let path = layout.resource(namespace.as_deref(), &kind.group, &kind.plural, format);
    artifacts::write_file(&path, &bytes).await
}

/// Removes managed fields from `obj` and, if it is a secret, replaces every
/// value in its `data` with [`REDACTED`]
pub fn redact(kind: &ResourceKind, obj: &mut DynamicObject) {
    obj.metadata.managed_fields = None;

    let is_secret = kind.is_secret()
        || obj
            .types
            .as_ref()
            .is_some_and(|t| t.api_version == "v1" && t.kind == "Secret");
    if !is_secret {
        return;
    }
    if let Some(data) = obj.data.get_mut("data").and_then(|d| d.as_object_mut()) {
        for value in data.values_mut() {
            *value = serde_json::Value::String(REDACTED.to_string());
        }
    }
}

fn encode(
    scope: &KindScope,
    items: &[DynamicObject],
    format: OutputFormat,
) -> Result<Vec<u8>, ItemError> {
    let doc = ListDocument {
        api_version: scope.kind.api_version(),
        kind: format!("{}List", scope.kind.kind),
        items,
    };
    let json_error = |source| ItemError::Json {
        context: scope.to_string(),
        source,
    };
    match format {
        OutputFormat::Json => serde_json::to_vec_pretty(&doc).map_err(json_error),
        OutputFormat::Yaml => {
            let json = serde_json::to_value(&doc).map_err(json_error)?;
            let yaml = serde_yaml::to_string(&json).map_err(|source| ItemError::Yaml {
                context: scope.to_string(),
                source,
            })?;
            Ok(yaml.into_bytes())
        }
    }
}
