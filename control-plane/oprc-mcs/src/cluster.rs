use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams};
use tracing::debug;

use crate::selector::LabelSelector;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("kube api error: {0}")]
    Kube(#[source] kube::Error),
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound,
            _ => ApiError::Kube(e),
        }
    }
}

/// Cluster calls made while reconciling.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Service, ApiError>;

    /// Deletes every EndpointSlice in `namespace` matching `selector`.
    async fn delete_endpoint_slices(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Service, ApiError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn delete_endpoint_slices(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), ApiError> {
        let api: Api<EndpointSlice> =
            Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&selector.to_string());
        api.delete_collection(&DeleteParams::default(), &lp).await?;
        debug!(%namespace, %selector, "endpoint slices deleted");
        Ok(())
    }
}
