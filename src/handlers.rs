use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, SerializePatchError,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::decider::{Decision, MutationDecider};
use crate::metrics::{InjectorMetrics, RequestLabels};
use crate::patch::{self, PatchError};

pub struct AppState {
    pub decider: MutationDecider,
    pub metrics: InjectorMetrics,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to decode pod: {0}")]
    ObjectDecode(#[source] serde_json::Error),
    #[error(transparent)]
    PatchBuild(#[from] PatchError),
    #[error("failed to encode patch: {0}")]
    PatchEncode(#[from] SerializePatchError),
}

pub async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let start = Instant::now();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to deserialize AdmissionReview: {e}");
            let resp = AdmissionResponse::invalid(format!("failed to deserialize request: {e}"));
            return review_to_json(resp.into_review());
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            let resp = AdmissionResponse::invalid("missing request field in AdmissionReview");
            return review_to_json(resp.into_review());
        }
    };

    record_request_metrics(&state, &req);

    // The decision reads the sidecar configuration from disk.
    let worker_state = state.clone();
    let worker_req = req.clone();
    let outcome = tokio::task::spawn_blocking(move || mutate(&worker_state, &worker_req)).await;

    let response = match outcome {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(uid = %req.uid, "rejecting admission request: {e}");
            AdmissionResponse::from(&req).deny(e.to_string())
        }
        Err(e) => {
            error!(uid = %req.uid, "sidecar injection failed, admitting unchanged: {e}");
            let mut resp = AdmissionResponse::from(&req);
            resp.warnings = Some(vec![
                "sidecar-injector: internal error during injection, pod admitted unchanged"
                    .to_string(),
            ]);
            resp
        }
    };

    state.metrics.record_response(response.allowed);
    state
        .metrics
        .admission_request_duration_seconds
        .observe(start.elapsed().as_secs_f64());

    review_to_json(response.into_review())
}

fn mutate(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, AdmissionError> {
    let Some(object) = &req.object else {
        debug!(uid = %req.uid, "request carries no object, nothing to inject");
        return Ok(AdmissionResponse::from(req));
    };

    if req.kind.kind != "Pod" {
        debug!(uid = %req.uid, kind = %req.kind.kind, "not a pod, nothing to inject");
        return Ok(AdmissionResponse::from(req));
    }

    let pod = decode_pod(object)?;
    let namespace = pod
        .metadata
        .namespace
        .as_deref()
        .or(req.namespace.as_deref())
        .unwrap_or_default();
    let no_annotations = BTreeMap::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&no_annotations);
    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or("<unknown>");

    let decision = state.decider.decide(namespace, annotations);
    state.metrics.record_decision(&decision);

    let config = match decision {
        Decision::Required(config) => config,
        Decision::NotRequired(reason) => {
            info!(uid = %req.uid, pod = pod_name, namespace, %reason, "skipping sidecar injection");
            return Ok(AdmissionResponse::from(req));
        }
    };

    let patch = patch::pod_patch(&pod, &config)?;
    info!(
        uid = %req.uid,
        pod = pod_name,
        namespace,
        containers = config.containers.len(),
        volumes = config.volumes.len(),
        operations = patch.0.len(),
        "injecting sidecars"
    );

    Ok(AdmissionResponse::from(req).with_patch(patch)?)
}

fn decode_pod(object: &DynamicObject) -> Result<Pod, AdmissionError> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(AdmissionError::ObjectDecode)
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<serde_json::Value> {
    match serde_json::to_value(review) {
        Ok(value) => Json(value),
        Err(e) => {
            error!("failed to encode AdmissionReview: {e}");
            let resp = AdmissionResponse::invalid(format!("failed to encode response: {e}"));
            Json(serde_json::to_value(resp.into_review()).unwrap_or_default())
        }
    }
}

fn record_request_metrics(state: &AppState, req: &AdmissionRequest<DynamicObject>) {
    let operation = format!("{:?}", req.operation).to_uppercase();
    let resource = req.resource.resource.clone();

    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation,
            resource,
        })
        .inc();
}
