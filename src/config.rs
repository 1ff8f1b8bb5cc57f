use std::collections::BTreeSet;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

use crate::decider::InjectionSettings;

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_config_dir() -> String {
    "/etc/sidecar-injector/sidecars".to_string()
}

fn default_ignored_namespaces() -> BTreeSet<String> {
    ["kube-system", "kube-public"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_marker() -> String {
    "it".to_string()
}

fn default_file_annotation() -> String {
    "file".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory the `file` annotation is resolved against.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default)]
    pub injection: InjectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    #[serde(default = "default_ignored_namespaces")]
    pub ignored_namespaces: BTreeSet<String>,
    #[serde(default = "default_marker")]
    pub annotation_marker: String,
    #[serde(default = "default_file_annotation")]
    pub file_annotation: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            ignored_namespaces: default_ignored_namespaces(),
            annotation_marker: default_marker(),
            file_annotation: default_file_annotation(),
        }
    }
}

impl InjectionConfig {
    pub fn settings(&self) -> InjectionSettings {
        InjectionSettings {
            ignored_namespaces: self.ignored_namespaces.clone(),
            marker: self.annotation_marker.clone(),
            file_annotation: self.file_annotation.clone(),
        }
    }
}

impl InjectorConfig {
    /// A missing settings file is not an error; every field has a default.
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("INJECTOR_").split("__"))
            .extract()
            .map_err(Box::new)
    }
}
