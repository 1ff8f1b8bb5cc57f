use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{Container, Pod, Volume};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::sidecar::SidecarConfig;

const CONTAINERS_PATH: [&str; 2] = ["spec", "containers"];
const VOLUMES_PATH: [&str; 2] = ["spec", "volumes"];

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to encode patch value for '/{path}': {source}")]
    Encode {
        path: String,
        source: serde_json::Error,
    },
}

pub fn pod_patch(pod: &Pod, config: &SidecarConfig) -> Result<Patch, PatchError> {
    let spec = pod.spec.as_ref();
    let existing_containers = spec.map(|s| s.containers.as_slice()).unwrap_or_default();
    let existing_volumes = spec.and_then(|s| s.volumes.as_deref()).unwrap_or_default();

    build_patch(
        existing_containers,
        &config.containers,
        existing_volumes,
        &config.volumes,
    )
}

pub fn build_patch(
    existing_containers: &[Container],
    add_containers: &[Container],
    existing_volumes: &[Volume],
    add_volumes: &[Volume],
) -> Result<Patch, PatchError> {
    let mut operations = append_operations(&CONTAINERS_PATH, existing_containers, add_containers)?;
    operations.extend(append_operations(&VOLUMES_PATH, existing_volumes, add_volumes)?);
    Ok(Patch(operations))
}

/// Operations that leave the list at `base` holding `existing` followed by
/// `additions`. An `/-` append needs an existing array, so when the list is
/// empty the first addition creates it as a one-element array.
pub fn append_operations<T: Serialize>(
    base: &[&str],
    existing: &[T],
    additions: &[T],
) -> Result<Vec<PatchOperation>, PatchError> {
    let mut operations = Vec::with_capacity(additions.len());

    for (i, addition) in additions.iter().enumerate() {
        let value = serde_json::to_value(addition).map_err(|source| PatchError::Encode {
            path: base.join("/"),
            source,
        })?;

        let operation = if existing.is_empty() && i == 0 {
            AddOperation {
                path: PointerBuf::from_tokens(base.iter().copied()),
                value: Value::Array(vec![value]),
            }
        } else {
            AddOperation {
                path: PointerBuf::from_tokens(base.iter().copied().chain(["-"])),
                value,
            }
        };
        operations.push(PatchOperation::Add(operation));
    }

    Ok(operations)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, PodSpec};
    use serde_json::json;

    use super::*;

    fn container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("{name}:1")),
            ..Default::default()
        }
    }

    fn volume(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }

    fn apply(mut doc: Value, patch: &Patch) -> Value {
        json_patch::patch(&mut doc, &patch.0).unwrap();
        doc
    }

    #[test]
    fn test_empty_list_creates_then_appends() {
        let a = container("a");
        let b = container("b");

        let ops = append_operations(&CONTAINERS_PATH, &[], &[a.clone(), b.clone()]).unwrap();

        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([
                {"op": "add", "path": "/spec/containers", "value": [a]},
                {"op": "add", "path": "/spec/containers/-", "value": b},
            ])
        );
    }

    #[test]
    fn test_non_empty_list_appends_only() {
        let a = container("a");

        let ops = append_operations(&CONTAINERS_PATH, &[container("app")], &[a.clone()]).unwrap();

        assert_eq!(
            serde_json::to_value(&ops).unwrap(),
            json!([{"op": "add", "path": "/spec/containers/-", "value": a}])
        );
    }

    #[test]
    fn test_no_additions_no_operations() {
        let none: &[Volume] = &[];
        assert!(append_operations(&VOLUMES_PATH, none, none).unwrap().is_empty());
        assert!(append_operations(&VOLUMES_PATH, &[volume("data")], none).unwrap().is_empty());
    }

    #[test]
    fn test_containers_precede_volumes() {
        let patch = build_patch(
            &[container("app")],
            &[container("proxy")],
            &[],
            &[volume("certs"), volume("cache")],
        )
        .unwrap();

        let paths: Vec<String> = patch
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(add) => add.path.to_string(),
                other => panic!("unexpected operation {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            ["/spec/containers/-", "/spec/volumes", "/spec/volumes/-"]
        );
    }

    #[test]
    fn test_round_trip_onto_existing_lists() {
        let app = container("app");
        let data = volume("data");
        let additions = [container("proxy"), container("logger")];
        let volumes = [volume("certs")];

        let patch = build_patch(
            std::slice::from_ref(&app),
            &additions,
            std::slice::from_ref(&data),
            &volumes,
        )
        .unwrap();
        let doc = json!({"spec": {"containers": [app], "volumes": [data]}});

        assert_eq!(
            apply(doc, &patch),
            json!({"spec": {
                "containers": [app, additions[0], additions[1]],
                "volumes": [data, volumes[0]],
            }})
        );
    }

    #[test]
    fn test_round_trip_onto_missing_lists() {
        let additions = [container("proxy"), container("logger"), container("agent")];
        let volumes = [volume("certs"), volume("cache")];

        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![],
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = SidecarConfig {
            containers: additions.to_vec(),
            volumes: volumes.to_vec(),
        };
        let patch = pod_patch(&pod, &config).unwrap();
        let doc = json!({"spec": {"containers": []}});

        assert_eq!(patch.0.len(), 5);
        assert_eq!(
            apply(doc, &patch),
            json!({"spec": {
                "containers": [additions[0], additions[1], additions[2]],
                "volumes": [volumes[0], volumes[1]],
            }})
        );
    }

    #[test]
    fn test_pod_patch_reads_existing_lists_from_spec() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("app")],
                volumes: Some(vec![volume("data")]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = SidecarConfig {
            containers: vec![container("proxy")],
            volumes: vec![volume("certs")],
        };

        let patch = pod_patch(&pod, &config).unwrap();

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([
                {"op": "add", "path": "/spec/containers/-", "value": config.containers[0]},
                {"op": "add", "path": "/spec/volumes/-", "value": config.volumes[0]},
            ])
        );
    }
}
