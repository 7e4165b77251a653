use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying the namespace of the service this import mirrors.
pub const ORIGIN_NAMESPACE_ANNOTATION: &str = "origin-namespace";
/// Annotation carrying the name of the service this import mirrors.
pub const ORIGIN_NAME_ANNOTATION: &str = "origin-name";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lighthouse.submariner.io",
    version = "v2alpha1",
    kind = "ServiceImport",
    plural = "serviceimports",
    namespaced,
    status = "ServiceImportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
    #[serde(rename = "type", default)]
    pub type_: ServiceImportType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ServiceImportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ClusterStatus {
    pub cluster: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ServicePort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub port: i32,
}

/// Only `Headless` imports need per-pod endpoint mirroring.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default,
)]
pub enum ServiceImportType {
    Headless,
    #[default]
    #[serde(rename = "ClusterSetIP")]
    ClusterSetIp,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ServiceImportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceImportType::Headless => write!(f, "Headless"),
            ServiceImportType::ClusterSetIp => write!(f, "ClusterSetIP"),
            ServiceImportType::Unknown => write!(f, "Unknown"),
        }
    }
}
