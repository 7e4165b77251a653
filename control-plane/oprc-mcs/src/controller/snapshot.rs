use std::collections::BTreeMap;
use std::fmt;

use kube::ResourceExt;

use crate::crd::service_import::{
    ORIGIN_NAME_ANNOTATION, ORIGIN_NAMESPACE_ANNOTATION, ServiceImport,
    ServiceImportType,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RefParseError {
    #[error("key {0:?} is not of the form namespace/name")]
    Malformed(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("service import has no name")]
    MissingName,
    #[error("service import {0} has no namespace")]
    MissingNamespace(String),
    #[error("tombstone for {0} carries no last known object")]
    EmptyTombstone(String),
}

/// Identity of a service import; renders as the `namespace/name` key shared
/// by the queue, the caches and the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceImportRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceImportRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, RefParseError> {
        match key.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(ns, name))
            }
            _ => Err(RefParseError::Malformed(key.to_string())),
        }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn from_object(obj: &ServiceImport) -> Result<Self, SnapshotError> {
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(SnapshotError::MissingName)?;
        let namespace = obj
            .metadata
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SnapshotError::MissingNamespace(name.clone()))?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ServiceImportRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What the controller needs to know about an import, captured once so the
/// delete path can run after the object has left the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceImportSnapshot {
    pub import_ref: ServiceImportRef,
    pub uid: String,
    pub import_type: ServiceImportType,
    pub origin_namespace: String,
    pub origin_name: String,
    pub labels: BTreeMap<String, String>,
}

impl ServiceImportSnapshot {
    pub fn is_headless(&self) -> bool {
        self.import_type == ServiceImportType::Headless
    }

    pub fn key(&self) -> String {
        self.import_ref.key()
    }

    /// Value of the `app` label, empty when unset.
    pub fn app_label(&self) -> &str {
        self.labels.get("app").map(String::as_str).unwrap_or_default()
    }
}

impl TryFrom<&ServiceImport> for ServiceImportSnapshot {
    type Error = SnapshotError;

    fn try_from(obj: &ServiceImport) -> Result<Self, Self::Error> {
        let import_ref = ServiceImportRef::from_object(obj)?;
        let annotations = obj.annotations();
        let annotation = |k: &str| annotations.get(k).cloned().unwrap_or_default();
        Ok(Self {
            import_ref,
            uid: obj.uid().unwrap_or_default(),
            import_type: obj.spec.type_,
            origin_namespace: annotation(ORIGIN_NAMESPACE_ANNOTATION),
            origin_name: annotation(ORIGIN_NAME_ANNOTATION),
            labels: obj.labels().clone(),
        })
    }
}
