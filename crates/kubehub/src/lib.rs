//! Weir kubehub: [`RemoteSource`] backed by a live cluster through `kube::Api`.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy, WatchParams},
    core::{DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{self, Scope},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};
use weir_core::{
    DeleteOptions, ListOptions, Object, ObjectList, Propagation, RemoteSource, WatchEvent, WatchStream, WeirError,
    WeirResult,
};

/// One collection on the API server, optionally scoped to a namespace.
pub struct KubeSource<K> {
    api: Api<K>,
    resource: String,
    namespace: Option<String>,
}

impl<K> KubeSource<K> {
    /// Wrap an existing `Api`; `resource` names the collection in errors.
    pub fn from_api(api: Api<K>, resource: &str, namespace: Option<&str>) -> Self {
        Self { api, resource: resource.to_string(), namespace: namespace.map(str::to_string) }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    pub fn resource(&self) -> &str { &self.resource }
}

impl<K> KubeSource<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    /// Every object of `K` the client can see.
    pub fn all(client: Client) -> Self {
        let plural = K::plural(&Default::default()).into_owned();
        Self::from_api(Api::all(client), &plural, None)
    }

    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        let plural = K::plural(&Default::default()).into_owned();
        Self::from_api(Api::namespaced(client, namespace), &plural, Some(namespace))
    }
}

impl KubeSource<DynamicObject> {
    /// Resolve `group/version/Kind` (or `version/Kind` for the core group) via
    /// discovery. `namespace` is ignored for cluster-scoped kinds.
    pub async fn dynamic(client: Client, gvk_key: &str, namespace: Option<&str>) -> WeirResult<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, caps) =
            discovery::pinned_kind(&client, &gvk).await.map_err(|e| map_error(e, gvk_key, &gvk.kind))?;
        let namespace = match caps.scope {
            Scope::Namespaced => namespace,
            Scope::Cluster => None,
        };
        let api = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, plural = %ar.plural, "kubehub: resolved dynamic source");
        Ok(Self::from_api(api, &ar.plural, namespace))
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> WeirResult<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(WeirError::Invalid(format!("invalid gvk key: {key} (expect v1/Kind or group/v1/Kind)"))),
    }
}

/// Translate a kube error into the library taxonomy by HTTP status.
pub fn map_error(err: kube::Error, resource: &str, name: &str) -> WeirError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => WeirError::not_found(resource, name),
            409 => WeirError::Conflict(resp.message),
            410 => WeirError::Expired(resp.message),
            code => WeirError::Transport(format!("{code} {}: {}", resp.reason, resp.message)),
        },
        other => WeirError::Transport(other.to_string()),
    }
}

pub fn list_params(opts: &ListOptions) -> ListParams {
    ListParams {
        label_selector: opts.label_selector.clone(),
        field_selector: opts.field_selector.clone(),
        timeout: opts.timeout_secs,
        resource_version: opts.resource_version.clone(),
        ..ListParams::default()
    }
}

pub fn watch_params(opts: &ListOptions) -> WatchParams {
    WatchParams {
        label_selector: opts.label_selector.clone(),
        field_selector: opts.field_selector.clone(),
        timeout: opts.timeout_secs,
        ..WatchParams::default()
    }
}

pub fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    DeleteParams {
        grace_period_seconds: opts.grace_period_seconds,
        propagation_policy: opts.propagation.map(|p| match p {
            Propagation::Orphan => PropagationPolicy::Orphan,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
        }),
        ..DeleteParams::default()
    }
}

// managedFields are never cached
fn slim<K: Resource>(mut obj: K) -> K {
    obj.meta_mut().managed_fields = None;
    obj
}

pub fn convert_event<K: Resource>(ev: KubeEvent<K>, resource: &str) -> WeirResult<WatchEvent<K>> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(slim(o))),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(slim(o))),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(slim(o))),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeEvent::Error(e) if e.code == 410 => Err(WeirError::Expired(format!("{resource}: {}", e.message))),
        KubeEvent::Error(e) => Err(WeirError::Transport(format!("{resource}: {} {}: {}", e.code, e.reason, e.message))),
    }
}

fn name_of<K: Resource>(obj: &K) -> WeirResult<String> {
    obj.meta().name.clone().filter(|n| !n.is_empty()).ok_or_else(|| WeirError::Invalid("metadata.name is required".into()))
}

#[async_trait::async_trait]
impl<K> RemoteSource<K> for KubeSource<K>
where
    K: Object + Serialize + DeserializeOwned + Debug,
{
    async fn list(&self, opts: &ListOptions) -> WeirResult<ObjectList<K>> {
        let list = self.api.list(&list_params(opts)).await.map_err(|e| map_error(e, &self.resource, ""))?;
        debug!(resource = %self.resource, count = list.items.len(), "kubehub: listed");
        Ok(ObjectList {
            items: list.items.into_iter().map(slim).collect(),
            resource_version: list.metadata.resource_version,
        })
    }

    async fn get(&self, name: &str) -> WeirResult<K> {
        self.api.get(name).await.map(slim).map_err(|e| map_error(e, &self.resource, name))
    }

    async fn create(&self, obj: &K) -> WeirResult<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api.create(&PostParams::default(), obj).await.map_err(|e| map_error(e, &self.resource, &name))
    }

    async fn update(&self, obj: &K) -> WeirResult<K> {
        let name = name_of(obj)?;
        self.api.replace(&name, &PostParams::default(), obj).await.map_err(|e| map_error(e, &self.resource, &name))
    }

    async fn delete(&self, name: &str, opts: &DeleteOptions) -> WeirResult<()> {
        self.api.delete(name, &delete_params(opts)).await.map_err(|e| map_error(e, &self.resource, name))?;
        Ok(())
    }

    async fn delete_collection(&self, delete: &DeleteOptions, list: &ListOptions) -> WeirResult<()> {
        let lp = ListParams { resource_version: None, ..list_params(list) };
        self.api.delete_collection(&delete_params(delete), &lp).await.map_err(|e| map_error(e, &self.resource, ""))?;
        Ok(())
    }

    async fn watch(&self, opts: &ListOptions) -> WeirResult<WatchStream<K>> {
        // "0" lets the server start from any version it still holds
        let version = opts.resource_version.clone().unwrap_or_else(|| "0".to_string());
        let stream = self
            .api
            .watch(&watch_params(opts), &version)
            .await
            .map_err(|e| map_error(e, &self.resource, ""))?;
        counter!("weir_kubehub_watches_total", 1);
        debug!(resource = %self.resource, rv = %version, "kubehub: watch opened");
        let resource = self.resource.clone();
        Ok(stream
            .map(move |item| match item {
                Ok(ev) => convert_event(ev, &resource),
                Err(e) => Err(map_error(e, &resource, "")),
            })
            .boxed())
    }
}
