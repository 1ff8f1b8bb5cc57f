use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::annotations::apply_image_overrides;
use crate::sidecar::{self, ConfigSource, SidecarConfig};

#[derive(Debug, Clone)]
pub struct InjectionSettings {
    pub ignored_namespaces: BTreeSet<String>,
    pub marker: String,
    /// Annotation whose value names the sidecar configuration document.
    pub file_annotation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    IgnoredNamespace,
    ConfigUnavailable,
    NoContainers,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::IgnoredNamespace => "ignored_namespace",
            SkipReason::ConfigUnavailable => "config_unavailable",
            SkipReason::NoContainers => "no_containers",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NotRequired(SkipReason),
    Required(SidecarConfig),
}

pub struct MutationDecider {
    settings: InjectionSettings,
    source: Arc<dyn ConfigSource>,
}

impl MutationDecider {
    pub fn new(settings: InjectionSettings, source: Arc<dyn ConfigSource>) -> Self {
        Self { settings, source }
    }

    /// Configuration errors are logged and never fail the admission.
    pub fn decide(&self, namespace: &str, annotations: &BTreeMap<String, String>) -> Decision {
        if self.settings.ignored_namespaces.contains(namespace) {
            debug!(namespace, "namespace is ignored, skipping injection");
            return Decision::NotRequired(SkipReason::IgnoredNamespace);
        }

        let name = annotations
            .get(&self.settings.file_annotation)
            .map(String::as_str)
            .unwrap_or_default();

        let mut config = match sidecar::load(self.source.as_ref(), name) {
            Ok(config) => config,
            Err(e) => {
                warn!(namespace, config = name, "sidecar configuration unavailable: {e}");
                return Decision::NotRequired(SkipReason::ConfigUnavailable);
            }
        };

        let overridden = apply_image_overrides(&mut config, annotations, &self.settings.marker);

        if config.containers.is_empty() {
            debug!(namespace, config = name, "sidecar configuration has no containers");
            return Decision::NotRequired(SkipReason::NoContainers);
        }

        debug!(
            namespace,
            config = name,
            containers = config.containers.len(),
            volumes = config.volumes.len(),
            overridden,
            "injection required"
        );
        Decision::Required(config)
    }
}
