//! Sidecar injection webhook
//!
//! Pods annotated `sidecar.tether.dev/name: default` get the default sidecar:
//!
//! 1. The governing selector is the Pod's lexicographically first label
//!    (ignoring keys containing `sidecar-enable`), and names the shared
//!    record `{key}-{value}-default-sidecar`.
//! 2. The record is created with one replica, or its replica count is bumped.
//!    The write is conditional on the observed resourceVersion and the whole
//!    read-modify-write is retried on conflict, so concurrent injections are
//!    all counted.
//! 3. The injection template is rendered against the record.
//! 4. Application containers wait for the sidecar socket and mount the
//!    socket volume; the sidecar containers and volumes are appended.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Pod, VolumeMount};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{debug, error, info};

use super::{decode_pod, patch::patch_response, WebhookError, WebhookState};
use crate::crd::{Sidecar, SidecarSpec};
use crate::retry::{retry_while, RetryConfig};
use crate::store::{LabelSelector, SidecarStore};
use crate::template::SIDECAR_INJECTION_TEMPLATE;

/// Annotation selecting the sidecar profile to inject
pub const SIDECAR_NAME_ANNOTATION: &str = "sidecar.tether.dev/name";

/// Substring marking labels that only switch injection on; never a governing label
pub const SIDECAR_ENABLE_MARKER: &str = "sidecar-enable";

/// Profile value of [`SIDECAR_NAME_ANNOTATION`] handled by this webhook
pub const DEFAULT_PROFILE: &str = "default";

/// Volume shared between the sidecar and application containers
pub const SOCKET_VOLUME_NAME: &str = "sidecar-socket";

/// Mount path of the socket volume when it is an emptyDir
pub const DEFAULT_SOCKET_DIR: &str = "/var/run";

/// Socket the sidecar creates once it is ready
pub const SOCKET_PATH: &str = "/var/run/sidecar.sock";

/// Shell prefix blocking an application command until the socket exists
pub const WAIT_FOR_SOCKET: &str = "while [ ! -e /var/run/sidecar.sock ]; do sleep 1; done;";

/// Returns true if the Pod asks for the default sidecar
pub fn wants_default_sidecar(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SIDECAR_NAME_ANNOTATION))
        .is_some_and(|profile| profile == DEFAULT_PROFILE)
}

/// The label governing which Sidecar record the Pod counts against
pub fn governing_selector(pod: &Pod) -> Result<LabelSelector, WebhookError> {
    pod.metadata
        .labels
        .iter()
        .flatten()
        .filter(|(key, _)| !key.contains(SIDECAR_ENABLE_MARKER))
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(key, value)| LabelSelector::new(key, value))
        .ok_or_else(|| WebhookError::precondition("the pod doesn't contain a pod selector"))
}

/// Name of the default Sidecar record for a governing selector
pub fn record_name(selector: &LabelSelector) -> String {
    format!("{}-{}-default-sidecar", selector.key, selector.value)
}

/// Create the default record, or count one more replica on it
///
/// Creation races and stale updates come back as conflicts and rerun the
/// whole lookup, up to `retry.max_attempts` times.
pub async fn resolve_record(
    store: &dyn SidecarStore,
    retry: &RetryConfig,
    namespace: &str,
    selector: &LabelSelector,
) -> Result<Sidecar, crate::Error> {
    let name = record_name(selector);
    let name = name.as_str();

    retry_while(retry, "resolve sidecar record", crate::Error::is_conflict, move || async move {
        match store.get(namespace, name).await? {
            None => {
                let mut sidecar = Sidecar::new(name, SidecarSpec::default_for(selector.to_string()));
                sidecar.metadata.namespace = Some(namespace.to_string());
                debug!(sidecar = %name, namespace = %namespace, "Creating default sidecar record");
                store.create(&sidecar).await
            }
            Some(mut sidecar) => {
                sidecar.spec.replicas = sidecar.spec.replicas.checked_add(1).ok_or_else(|| {
                    crate::Error::validation(format!("sidecar record {name} is at its replica limit"))
                })?;
                debug!(sidecar = %name, replicas = sidecar.spec.replicas, "Updating default sidecar record");
                store.replace(&sidecar).await
            }
        }
    })
    .await
}

/// Merge the rendered template Pod into the admitted Pod
///
/// - every application command waits for [`SOCKET_PATH`]
/// - the record's service selector is added to the Pod labels
/// - every application container mounts [`SOCKET_VOLUME_NAME`]
/// - template containers and volumes are appended after the originals
pub fn merge_sidecar(sidecar: &Sidecar, template: Pod, pod: &mut Pod) -> Result<(), WebhookError> {
    let service: LabelSelector = sidecar.spec.service.selector.parse().map_err(|_| {
        WebhookError::precondition(format!(
            "sidecar service selector {:?} is not of the form key=value",
            sidecar.spec.service.selector
        ))
    })?;

    let mount_path = if sidecar.spec.uses_pvc() {
        sidecar.spec.volume.mount_path.clone()
    } else {
        DEFAULT_SOCKET_DIR.to_string()
    };

    let spec = pod.spec.get_or_insert_with(Default::default);
    for container in spec.containers.iter_mut() {
        // Commands are expected as [shell, -c, script]; the script comes last
        if let Some(script) = container.command.as_mut().and_then(|c| c.last_mut()) {
            script.insert_str(0, WAIT_FOR_SOCKET);
        }
        container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: SOCKET_VOLUME_NAME.to_string(),
                mount_path: mount_path.clone(),
                ..Default::default()
            });
    }

    let template_spec = template.spec.unwrap_or_default();
    spec.containers.extend(template_spec.containers);
    if let Some(volumes) = template_spec.volumes {
        spec.volumes.get_or_insert_with(Vec::new).extend(volumes);
    }

    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(service.key, service.value);

    Ok(())
}

/// Handle mutating admission review for sidecar injection
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match mutate_pod(&state, &req).await {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Rejecting sidecar injection");
            e.into_admission_response(&req)
        }
    };
    Json(response.into_review())
}

/// Process a single sidecar injection request
pub async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, WebhookError> {
    let uid = &request.uid;

    let Some((original, mut pod)) = decode_pod(request)? else {
        debug!(uid = %uid, "No pod object in request, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    };

    if !wants_default_sidecar(&pod) {
        debug!(uid = %uid, pod = ?pod.metadata.name, "No default sidecar requested, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    }

    let selector = governing_selector(&pod)?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .or_else(|| request.namespace.clone())
        .unwrap_or_else(|| "default".to_string());

    // Read before touching the record, so a missing template costs no replica
    let template = state.templates.read_template(SIDECAR_INJECTION_TEMPLATE)?;

    let sidecar =
        resolve_record(state.sidecars.as_ref(), &state.retry, &namespace, &selector).await?;
    let template_pod = state.engine.render_pod(&template, &sidecar)?;

    merge_sidecar(&sidecar, template_pod, &mut pod)?;

    info!(
        uid = %uid,
        pod = ?pod.metadata.name,
        sidecar = ?sidecar.metadata.name,
        replicas = sidecar.spec.replicas,
        "Injected sidecar container"
    );
    patch_response(request, &original, &pod)
}
