use crate::config::{Config, IstioSettings};
use crate::injection::{ConfigStore, ResolveError, SidecarInjectionSpec, parse_injector_config};
use crate::mesh::{MeshMembership, MeshPolicy, ObservedPod};
use crate::meshversion::{ComponentInventory, ObservedComponent};
use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

pub async fn create_client() -> Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

/// Starts a watch-backed read cache for `api` and waits until its first listing completed.
async fn create_store<K>(
    api: Api<K>,
    timeout: Duration,
    shutdown: CancellationToken,
) -> Result<Store<K>>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let (store, writer) = reflector::store();

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => error!(%e, "unexpected error with stream"),
            }
        });

    tokio::spawn(async move {
        tokio::select! {
            _ = stream => {},
            _ = shutdown.cancelled() => {},
        }
    });

    tokio::time::timeout(timeout, store.wait_until_ready())
        .await
        .with_context(|| format!("Timed out waiting for the {} cache to sync", kind))?
        .with_context(|| format!("The {} cache was dropped before it synced", kind))?;
    info!("Synced {} cache with {} objects", kind, store.state().len());
    Ok(store)
}

/// Read-only view of the cluster objects the vetter needs, kept current by watches.
#[derive(Clone)]
pub struct ClusterState {
    pods: Store<Pod>,
    namespaces: Store<Namespace>,
    config_maps: Store<ConfigMap>,
    deployments: Option<Store<Deployment>>,
    policy: Arc<MeshPolicy>,
    istio: IstioSettings,
}

impl ClusterState {
    pub async fn start(
        client: Client,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.cache_sync_timeout_seconds.unwrap_or(30));
        let policy = MeshPolicy::from_config(config)?;

        info!("Starting pod, namespace and config map caches");
        let pods = create_store(Api::<Pod>::all(client.clone()), timeout, shutdown.clone()).await?;
        let namespaces =
            create_store(Api::<Namespace>::all(client.clone()), timeout, shutdown.clone()).await?;
        let config_maps = create_store(
            Api::<ConfigMap>::namespaced(client.clone(), &config.istio.namespace),
            timeout,
            shutdown.clone(),
        )
        .await?;

        let deployments = if config.feature_flags.check_component_versions {
            info!(
                "Starting deployment cache for namespace {}",
                config.istio.namespace
            );
            Some(
                create_store(
                    Api::<Deployment>::namespaced(client, &config.istio.namespace),
                    timeout,
                    shutdown,
                )
                .await?,
            )
        } else {
            None
        };

        Ok(ClusterState::new(
            pods,
            namespaces,
            config_maps,
            deployments,
            policy,
            config.istio.clone(),
        ))
    }

    fn new(
        pods: Store<Pod>,
        namespaces: Store<Namespace>,
        config_maps: Store<ConfigMap>,
        deployments: Option<Store<Deployment>>,
        policy: MeshPolicy,
        istio: IstioSettings,
    ) -> Self {
        ClusterState {
            pods,
            namespaces,
            config_maps,
            deployments,
            policy: Arc::new(policy),
            istio,
        }
    }
}

impl ConfigStore for ClusterState {
    fn injection_spec(&self) -> Result<SidecarInjectionSpec, ResolveError> {
        let location = format!(
            "{}/{}",
            self.istio.namespace, self.istio.injector_config_map
        );
        let config_map = self
            .config_maps
            .get(&ObjectRef::new(&self.istio.injector_config_map).within(&self.istio.namespace))
            .ok_or_else(|| ResolveError::NotFound(location.clone()))?;

        let raw = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(&self.istio.injector_config_key))
            .ok_or_else(|| {
                ResolveError::Malformed(format!(
                    "config map {} has no key {}",
                    location, self.istio.injector_config_key
                ))
            })?;

        parse_injector_config(raw)
    }
}

impl MeshMembership for ClusterState {
    fn list_pods(&self) -> Result<Vec<ObservedPod>> {
        let mesh_namespaces: HashSet<String> = self
            .namespaces
            .state()
            .iter()
            .filter(|ns| self.policy.namespace_in_mesh(ns))
            .map(|ns| ns.name_any())
            .collect();

        let mut pods: Vec<ObservedPod> = self
            .pods
            .state()
            .iter()
            .filter(|pod| {
                pod.namespace()
                    .is_some_and(|ns| mesh_namespaces.contains(&ns))
            })
            .filter(|pod| self.policy.pod_injected(pod))
            .filter_map(|pod| self.policy.observe(pod))
            .collect();

        pods.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(pods)
    }
}

impl ComponentInventory for ClusterState {
    fn list_components(&self) -> Result<Vec<ObservedComponent>> {
        let Some(deployments) = &self.deployments else {
            return Ok(Vec::new());
        };

        let mut components: Vec<ObservedComponent> = deployments
            .state()
            .iter()
            .map(|deployment| ObservedComponent {
                name: deployment.name_any(),
                image: deployment
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.template.spec.as_ref())
                    .and_then(|pod_spec| pod_spec.containers.first())
                    .and_then(|container| container.image.clone()),
            })
            .collect();

        components.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(components)
    }
}
