//! Vets the versions of the mesh's injected containers and components.
//!
//! The injector config names the sidecar and init images new workloads get.
//! Every pod in the mesh that runs something else gets a note, so operators
//! can see which workloads still need a restart after a mesh upgrade.

use crate::image_reference::ImageReference;
use crate::injection::{ConfigStore, ImagePair, ResolveError, resolve_injected_images};
use crate::mesh::{MeshMembership, ObservedPod};
use crate::note::{Attributes, Note, NoteLevel, NoteType, stamp_all};
use crate::vetter::{Info, Vetter};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

pub const VETTER_ID: &str = "MeshVersion";
const VETTER_VERSION: &str = "0.1.0";
const LATEST_TAG: &str = "latest";

const COMPONENT_MISMATCH_SUMMARY: &str = "Mismatched istio component versions - ${component_name}";
const COMPONENT_MISMATCH_MSG: &str = "Istio component ${component_name} is running version ${component_version} \
     but your environment is running istio version ${istio_version}. \
     Consider upgrading the component ${component_name} ";

const SIDECAR_MISMATCH_SUMMARY: &str = "Mismatched sidecar image - ${pod_name}";
const SIDECAR_MISMATCH_MSG: &str = "The pod ${pod_name} in namespace ${namespace} \
     is running with sidecar proxy image ${sidecar_image} \
     but your environment is injecting ${inject_sidecar_image} for \
     new workloads. Consider upgrading the sidecar proxy in the pod.";

const INIT_MISMATCH_SUMMARY: &str = "Mismatched istio-init image - ${pod_name}";
const INIT_MISMATCH_MSG: &str = "The pod ${pod_name} in namespace ${namespace} \
     is running with istio-init image ${init_image} \
     but your environment is injecting ${inject_init_image} for \
     new workloads. Consider upgrading the istio-init container in the pod.";

const MISSING_VERSION_SUMMARY: &str = "Missing version information";
const MISSING_VERSION_MSG: &str = "Cannot determine mesh version";

const INJECTION_DISABLED_SUMMARY: &str = "Sidecar injection is disabled";
const INJECTION_DISABLED_MSG: &str = "Automatic sidecar injection is disabled. \
     Enable it to run the ${vetter_id} vetter.";

/// A control plane workload and the image of its first container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedComponent {
    pub name: String,
    pub image: Option<String>,
}

/// Lists the control plane components running in the mesh's namespace.
pub trait ComponentInventory {
    fn list_components(&self) -> Result<Vec<ObservedComponent>>;
}

fn attributes<const N: usize>(pairs: [(&str, &str); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Compares each pod's sidecar and init image against what is injected today.
///
/// The two checks are independent, so a pod yields zero, one or two notes.
/// Comparison is exact string equality.
pub fn scan(pods: &[ObservedPod], desired: &ImagePair) -> Vec<Note> {
    let mut notes = Vec::new();
    for pod in pods {
        if let Some(sidecar_image) = pod
            .sidecar_image
            .as_deref()
            .filter(|image| *image != desired.sidecar)
        {
            notes.push(Note::new(
                NoteType::SidecarImageMismatch,
                SIDECAR_MISMATCH_SUMMARY,
                SIDECAR_MISMATCH_MSG,
                NoteLevel::Warning,
                attributes([
                    ("pod_name", pod.name.as_str()),
                    ("namespace", pod.namespace.as_str()),
                    ("sidecar_image", sidecar_image),
                    ("inject_sidecar_image", desired.sidecar.as_str()),
                ]),
            ));
        }

        if let Some(init_image) = pod
            .init_image
            .as_deref()
            .filter(|image| *image != desired.init)
        {
            notes.push(Note::new(
                NoteType::InitImageMismatch,
                INIT_MISMATCH_SUMMARY,
                INIT_MISMATCH_MSG,
                NoteLevel::Warning,
                attributes([
                    ("pod_name", pod.name.as_str()),
                    ("namespace", pod.namespace.as_str()),
                    ("init_image", init_image),
                    ("inject_init_image", desired.init.as_str()),
                ]),
            ));
        }
    }
    notes
}

/// Compares control plane component tags against the tag of the injected sidecar.
pub fn check_components(components: &[ObservedComponent], desired: &ImagePair) -> Vec<Note> {
    let mesh_version = ImageReference::parse(&desired.sidecar)
        .ok()
        .and_then(|image| image.tag)
        .filter(|tag| tag != LATEST_TAG);

    let Some(mesh_version) = mesh_version else {
        return vec![Note::new(
            NoteType::MissingVersion,
            MISSING_VERSION_SUMMARY,
            MISSING_VERSION_MSG,
            NoteLevel::Warning,
            attributes([("inject_sidecar_image", desired.sidecar.as_str())]),
        )];
    };

    let mut notes = Vec::new();
    for component in components {
        let Some(image) = component.image.as_deref() else {
            continue;
        };
        let tag = match ImageReference::parse(image) {
            Ok(ImageReference { tag: Some(tag), .. }) => tag,
            Ok(_) => continue,
            Err(e) => {
                debug!("Skipping component {}: {}", component.name, e);
                continue;
            }
        };
        if tag != mesh_version {
            notes.push(Note::new(
                NoteType::ComponentMismatch,
                COMPONENT_MISMATCH_SUMMARY,
                COMPONENT_MISMATCH_MSG,
                NoteLevel::Warning,
                attributes([
                    ("component_name", component.name.as_str()),
                    ("component_version", tag.as_str()),
                    ("istio_version", mesh_version.as_str()),
                ]),
            ));
        }
    }
    notes
}

/// Builds the informational note reported in place of a check when injection is switched off.
///
/// Returns `None` for every other resolver failure.
pub fn injection_disabled_note(
    err: &ResolveError,
    vetter_id: &str,
    note_type: NoteType,
) -> Option<Note> {
    match err {
        ResolveError::Disabled(_) => Some(Note::new(
            note_type,
            INJECTION_DISABLED_SUMMARY,
            INJECTION_DISABLED_MSG,
            NoteLevel::Info,
            attributes([("vetter_id", vetter_id)]),
        )),
        _ => None,
    }
}

pub struct MeshVersion<S> {
    cluster: S,
    check_components: bool,
}

impl<S> MeshVersion<S>
where
    S: ConfigStore + MeshMembership + ComponentInventory,
{
    pub fn new(cluster: S, check_components: bool) -> Self {
        MeshVersion {
            cluster,
            check_components,
        }
    }
}

impl<S> Vetter for MeshVersion<S>
where
    S: ConfigStore + MeshMembership + ComponentInventory,
{
    fn info(&self) -> Info {
        Info {
            id: VETTER_ID,
            version: VETTER_VERSION,
        }
    }

    fn vet(&self) -> Result<Vec<Note>> {
        let images = match resolve_injected_images(&self.cluster) {
            Ok(images) => images,
            Err(err) => {
                let notes: Vec<Note> =
                    injection_disabled_note(&err, VETTER_ID, NoteType::SidecarImageMismatch)
                        .into_iter()
                        .collect();
                if notes.is_empty() {
                    warn!("Skipping injected image check: {}", err);
                } else {
                    info!("Skipping injected image check: {}", err);
                }
                return Ok(stamp_all(notes));
            }
        };
        debug!(
            "Injector applies init image {} and sidecar image {}",
            images.init, images.sidecar
        );

        let pods = self
            .cluster
            .list_pods()
            .context("Failed to list pods in the mesh")?;
        let mut notes = scan(&pods, &images);

        if self.check_components {
            let components = self
                .cluster
                .list_components()
                .context("Failed to list mesh components")?;
            notes.extend(check_components(&components, &images));
        }

        debug!("Vetted {} pods, produced {} notes", pods.len(), notes.len());
        Ok(stamp_all(notes))
    }
}
