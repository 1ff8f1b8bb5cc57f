use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::sidecar::SidecarConfig;

/// Keys are visited in sorted order, so the last key naming a container wins.
pub fn apply_image_overrides(
    config: &mut SidecarConfig,
    annotations: &BTreeMap<String, String>,
    marker: &str,
) -> usize {
    let mut rewritten = 0;

    for (key, tag) in annotations {
        let Some(target) = override_target(key, marker) else {
            continue;
        };

        for container in config.containers.iter_mut().filter(|c| c.name == target) {
            let Some(image) = container.image.as_deref() else {
                warn!(
                    annotation = %key,
                    container = %container.name,
                    "image override targets a container without an image, skipping"
                );
                continue;
            };

            let retagged = retag(image, tag);
            debug!(
                annotation = %key,
                container = %container.name,
                from = %image,
                to = %retagged,
                "overriding sidecar image tag"
            );
            container.image = Some(retagged);
            rewritten += 1;
        }
    }

    rewritten
}

fn override_target<'a>(key: &'a str, marker: &str) -> Option<&'a str> {
    let mut segments = key.split('.');
    if segments.next()? != marker {
        return None;
    }
    segments.next().filter(|name| !name.is_empty())
}

fn retag(image: &str, tag: &str) -> String {
    let repository = image.split_once(':').map_or(image, |(repo, _)| repo);
    format!("{repository}:{tag}")
}
