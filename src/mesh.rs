use crate::config::Config;
use anyhow::Result;
use globset::GlobSet;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodSpec};
use kube::ResourceExt;

/// A pod's identity plus the images of the sidecar and init containers, when it has them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedPod {
    pub name: String,
    pub namespace: String,
    pub sidecar_image: Option<String>,
    pub init_image: Option<String>,
}

/// Lists the pods that are currently part of the mesh.
pub trait MeshMembership {
    fn list_pods(&self) -> Result<Vec<ObservedPod>>;
}

pub fn container_image<'a>(container_name: &str, spec: &'a PodSpec) -> Option<&'a str> {
    spec.containers
        .iter()
        .find(|c| c.name == container_name)
        .and_then(|c| c.image.as_deref())
}

pub fn init_container_image<'a>(container_name: &str, spec: &'a PodSpec) -> Option<&'a str> {
    spec.init_containers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|c| c.name == container_name)
        .and_then(|c| c.image.as_deref())
}

/// Decides which namespaces and pods belong to the mesh and how to read their injected images.
#[derive(Debug, Clone)]
pub struct MeshPolicy {
    injection_label: String,
    injection_label_value: String,
    injected_annotation: String,
    excluded_namespaces: GlobSet,
    sidecar_container_name: String,
    init_container_name: String,
}

impl MeshPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(MeshPolicy {
            injection_label: config.mesh.injection_label.clone(),
            injection_label_value: config.mesh.injection_label_value.clone(),
            injected_annotation: config.mesh.injected_annotation.clone(),
            excluded_namespaces: config.mesh.excluded_namespace_set()?,
            sidecar_container_name: config.istio.sidecar_container_name.clone(),
            init_container_name: config.istio.init_container_name.clone(),
        })
    }

    pub fn namespace_in_mesh(&self, namespace: &Namespace) -> bool {
        let name = namespace.name_any();
        if self.excluded_namespaces.is_match(&name) {
            return false;
        }
        namespace
            .labels()
            .get(&self.injection_label)
            .is_some_and(|value| *value == self.injection_label_value)
    }

    pub fn pod_injected(&self, pod: &Pod) -> bool {
        pod.annotations().contains_key(&self.injected_annotation)
    }

    /// Returns `None` for pods without a namespace.
    pub fn observe(&self, pod: &Pod) -> Option<ObservedPod> {
        let namespace = pod.namespace()?;
        let spec = pod.spec.as_ref();
        Some(ObservedPod {
            name: pod.name_any(),
            namespace,
            sidecar_image: spec
                .and_then(|s| container_image(&self.sidecar_container_name, s))
                .map(str::to_owned),
            init_image: spec
                .and_then(|s| init_container_image(&self.init_container_name, s))
                .map(str::to_owned),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{make_namespace, make_pod};
    use super::*;

    fn policy() -> MeshPolicy {
        MeshPolicy::from_config(&Config::default()).expect("default policy")
    }

    #[test]
    fn test_container_image_by_name() {
        let pod = make_pod("p", "ns", "proxy:1.0.0", "init:1.0.0");
        let spec = pod.spec.as_ref().expect("spec");
        assert_eq!(container_image("istio-proxy", spec), Some("proxy:1.0.0"));
        assert_eq!(container_image("app", spec), Some("docker.io/library/nginx:1.27"));
        assert_eq!(container_image("istio-init", spec), None);
        assert_eq!(init_container_image("istio-init", spec), Some("init:1.0.0"));
        assert_eq!(init_container_image("istio-proxy", spec), None);
    }

    #[test]
    fn test_init_container_image_without_init_containers() {
        let spec = PodSpec::default();
        assert_eq!(init_container_image("istio-init", &spec), None);
    }

    #[test]
    fn test_namespace_in_mesh() {
        let policy = policy();
        assert!(policy.namespace_in_mesh(&make_namespace("apps", Some("enabled"))));
        assert!(!policy.namespace_in_mesh(&make_namespace("apps", Some("disabled"))));
        assert!(!policy.namespace_in_mesh(&make_namespace("apps", None)));
        assert!(!policy.namespace_in_mesh(&make_namespace("kube-system", Some("enabled"))));
    }

    #[test]
    fn test_pod_injected_requires_status_annotation() {
        let policy = policy();
        let mut pod = make_pod("p", "ns", "proxy:1", "init:1");
        assert!(policy.pod_injected(&pod));
        pod.metadata.annotations = None;
        assert!(!policy.pod_injected(&pod));
    }

    #[test]
    fn test_observe_reads_both_images() {
        let observed = policy()
            .observe(&make_pod("p", "ns", "proxy:1", "init:1"))
            .expect("observed");
        assert_eq!(
            observed,
            ObservedPod {
                name: "p".into(),
                namespace: "ns".into(),
                sidecar_image: Some("proxy:1".into()),
                init_image: Some("init:1".into()),
            }
        );
    }

    #[test]
    fn test_observe_missing_containers_are_absent() {
        let mut pod = make_pod("p", "ns", "proxy:1", "init:1");
        pod.spec = Some(PodSpec::default());
        let observed = policy().observe(&pod).expect("observed");
        assert_eq!(observed.sidecar_image, None);
        assert_eq!(observed.init_image, None);

        pod.metadata.namespace = None;
        assert!(policy().observe(&pod).is_none());
    }
}
