//! Read-through view of Kubernetes Endpoints objects.
//!
//! The cache is a set of `kube` reflector stores fed by watches of
//! `Endpoints`: one per allowed namespace, or a single cluster-wide watch
//! when every namespace is allowed. Until a watch finishes its initial list,
//! lookups in its namespace read through to the API server so that early
//! queries still get an answer.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LookupError;
use crate::metrics::{self, RestartReason, WatchEventType};
use crate::service::{NamespaceAllowList, ServiceRef};

/// Interval for emitting cache metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Addresses of one Endpoints subset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    /// Ready addresses. Not-ready addresses are not included.
    pub addresses: Vec<String>,
}

/// Point-in-time view of the ready addresses behind a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    /// Address subsets of the Endpoints object.
    pub subsets: Vec<EndpointSubset>,
}

impl EndpointSnapshot {
    /// Snapshot with one subset per entry in `subsets`.
    pub fn from_addresses<I, S>(subsets: I) -> Self
    where
        I: IntoIterator<Item = Vec<S>>,
        S: Into<String>,
    {
        Self {
            subsets: subsets
                .into_iter()
                .map(|addrs| EndpointSubset {
                    addresses: addrs.into_iter().map(Into::into).collect(),
                })
                .collect(),
        }
    }

    /// True if any subset carries at least one ready address.
    pub fn has_ready_addresses(&self) -> bool {
        self.subsets.iter().any(|s| !s.addresses.is_empty())
    }
}

impl From<&Endpoints> for EndpointSnapshot {
    fn from(endpoints: &Endpoints) -> Self {
        let subsets = endpoints
            .subsets
            .iter()
            .flatten()
            .map(|subset| EndpointSubset {
                addresses: subset
                    .addresses
                    .iter()
                    .flatten()
                    .map(|addr| addr.ip.clone())
                    .collect(),
            })
            .collect();

        Self { subsets }
    }
}

/// Source of endpoint state keyed by (namespace, service).
#[async_trait]
pub trait EndpointCache: Send + Sync + 'static {
    /// Fetch the endpoint state of `service`.
    ///
    /// A missing object is an error (`LookupError::NotFound`), not an empty
    /// snapshot.
    async fn get(&self, service: &ServiceRef) -> Result<EndpointSnapshot, LookupError>;
}

/// One watch and the store it feeds.
#[derive(Clone)]
struct WatchScope {
    /// Watched namespace, `None` for all namespaces.
    namespace: Option<String>,
    store: Store<Endpoints>,
    ready: Arc<AtomicBool>,
}

impl WatchScope {
    fn covers(&self, namespace: &str) -> bool {
        self.namespace.as_deref().is_none_or(|ns| ns == namespace)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Namespaces to watch for `namespaces`; `None` is one cluster-wide watch.
fn watch_namespaces(namespaces: &NamespaceAllowList) -> Vec<Option<String>> {
    if namespaces.is_all() {
        vec![None]
    } else {
        namespaces.namespaces().iter().cloned().map(Some).collect()
    }
}

/// Store to answer from for `namespace`, if its watch has synced.
fn synced_scope<'a>(scopes: &'a [WatchScope], namespace: &str) -> Option<&'a WatchScope> {
    scopes
        .iter()
        .find(|s| s.covers(namespace))
        .filter(|s| s.is_ready())
}

/// Endpoint cache backed by `kube` reflectors.
#[derive(Clone)]
pub struct KubeEndpointCache {
    client: Client,
    scopes: Arc<[WatchScope]>,
}

impl KubeEndpointCache {
    /// Start watching Endpoints in the namespaces `namespaces` allows.
    ///
    /// The watches run on background tasks until `shutdown` is cancelled.
    pub fn start(client: Client, namespaces: &NamespaceAllowList, shutdown: CancellationToken) -> Self {
        let scopes: Arc<[WatchScope]> = watch_namespaces(namespaces)
            .into_iter()
            .map(|namespace| {
                let (store, writer) = reflector::store::<Endpoints>();
                let scope = WatchScope {
                    namespace,
                    store,
                    ready: Arc::new(AtomicBool::new(false)),
                };
                let api: Api<Endpoints> = match &scope.namespace {
                    Some(ns) => Api::namespaced(client.clone(), ns),
                    None => Api::all(client.clone()),
                };
                tokio::spawn(watch_endpoints(
                    api,
                    scope.namespace.clone(),
                    writer,
                    scope.ready.clone(),
                    shutdown.clone(),
                ));
                scope
            })
            .collect();

        let cache = Self { client, scopes };
        tokio::spawn(metrics_loop(cache.clone(), shutdown));

        cache
    }

    /// True once every watch has applied its initial list.
    pub fn is_ready(&self) -> bool {
        self.scopes.iter().all(WatchScope::is_ready)
    }

    /// Number of Endpoints objects held.
    pub fn len(&self) -> usize {
        self.scopes.iter().map(|s| s.store.state().len()).sum()
    }

    /// True when no store holds an object.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_through(&self, service: &ServiceRef) -> Result<Option<Endpoints>, LookupError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        Ok(api.get_opt(&service.service).await?)
    }
}

#[async_trait]
impl EndpointCache for KubeEndpointCache {
    async fn get(&self, service: &ServiceRef) -> Result<EndpointSnapshot, LookupError> {
        let not_found = || LookupError::NotFound {
            namespace: service.namespace.clone(),
            service: service.service.clone(),
        };

        if let Some(scope) = synced_scope(&self.scopes, &service.namespace) {
            let key = ObjectRef::new(&service.service).within(&service.namespace);
            return scope
                .store
                .get(&key)
                .map(|ep| EndpointSnapshot::from(ep.as_ref()))
                .ok_or_else(not_found);
        }

        debug!(%service, "endpoint cache not synced for namespace, reading through");
        self.read_through(service)
            .await?
            .map(|ep| EndpointSnapshot::from(&ep))
            .ok_or_else(not_found)
    }
}

/// Feed one reflector until shutdown.
async fn watch_endpoints(
    api: Api<Endpoints>,
    namespace: Option<String>,
    writer: reflector::store::Writer<Endpoints>,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let scope = namespace.as_deref().unwrap_or("*");
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    let mut stream = std::pin::pin!(stream);

    info!(namespace = scope, "Starting endpoints watch");
    metrics::record_watch_restart(RestartReason::InitialConnect);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(namespace = scope, "Endpoints watch shutting down");
                return;
            }

            event = stream.next() => {
                match event {
                    Some(Ok(event)) => handle_event(scope, &ready, &event),
                    Some(Err(e)) => {
                        // The watcher backs off and restarts after every error.
                        warn!(namespace = scope, "Endpoints watch error: {}", e);
                        metrics::record_watch_event(WatchEventType::Error);
                        metrics::record_watch_restart(RestartReason::Backoff);
                    }
                    None => {
                        warn!(namespace = scope, "Endpoints watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

fn handle_event(scope: &str, ready: &AtomicBool, event: &watcher::Event<Endpoints>) {
    match event {
        watcher::Event::Apply(_) => metrics::record_watch_event(WatchEventType::Apply),
        watcher::Event::Delete(_) => metrics::record_watch_event(WatchEventType::Delete),
        watcher::Event::Init => {
            debug!(namespace = scope, "endpoints initial list started");
            metrics::record_watch_event(WatchEventType::Init);
        }
        watcher::Event::InitApply(_) => metrics::record_watch_event(WatchEventType::InitApply),
        watcher::Event::InitDone => {
            if !ready.swap(true, Ordering::AcqRel) {
                info!(namespace = scope, "Endpoint cache synced");
            }
            metrics::record_watch_event(WatchEventType::InitDone);
        }
    }
}

/// Periodically emit cache metrics.
async fn metrics_loop(cache: KubeEndpointCache, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let objects = cache.len();
                metrics::record_cache_state(objects, cache.is_ready());
                debug!(objects, ready = cache.is_ready(), "emitted cache metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("cache metrics loop shutting down");
                return;
            }
        }
    }
}
