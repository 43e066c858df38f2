//! Kubernetes-backed record store
//!
//! `DNSRecord` objects are read and written as dynamic objects and converted
//! through JSON, so no generated client types are needed.

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use tracing::debug;

use super::{RecordKey, RecordStore, StoreError};
use crate::record::{DnsRecord, API_GROUP, API_VERSION, KIND, PLURAL};

pub struct KubeRecordStore {
    client: Client,
    resource: ApiResource,
}

impl KubeRecordStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: ApiResource {
                group: API_GROUP.to_string(),
                version: API_VERSION.to_string(),
                api_version: format!("{}/{}", API_GROUP, API_VERSION),
                kind: KIND.to_string(),
                plural: PLURAL.to_string(),
            },
        }
    }

    /// Connect with the ambient kubeconfig or in-cluster credentials
    pub async fn try_default() -> Result<Self, StoreError> {
        let client = Client::try_default()
            .await
            .map_err(|e| StoreError::Api(format!("failed to create Kubernetes client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn namespaced(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    fn all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.resource)
    }
}

fn to_record(object: DynamicObject) -> Result<DnsRecord, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn to_object(record: &DnsRecord) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(record)?)?)
}

fn map_error(key: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(key.to_string()),
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict(key.to_string()),
        other => StoreError::Api(other.to_string()),
    }
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<DnsRecord, StoreError> {
        let object = self
            .namespaced(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_error(&key.to_string(), e))?;
        to_record(object)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DnsRecord>, StoreError> {
        let api = match namespace {
            Some(namespace) => self.namespaced(namespace),
            None => self.all(),
        };
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(namespace.unwrap_or("*"), e))?;

        debug!(count = list.items.len(), "Listed DNSRecords");
        list.items.into_iter().map(to_record).collect()
    }

    async fn create(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let object = self
            .namespaced(&key.namespace)
            .create(&PostParams::default(), &to_object(record)?)
            .await
            .map_err(|e| map_error(&key.to_string(), e))?;
        to_record(object)
    }

    async fn update(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let object = self
            .namespaced(&key.namespace)
            .replace(&key.name, &PostParams::default(), &to_object(record)?)
            .await
            .map_err(|e| map_error(&key.to_string(), e))?;
        to_record(object)
    }

    async fn update_status(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let body = serde_json::to_vec(&to_object(record)?)?;
        let object = self
            .namespaced(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_error(&key.to_string(), e))?;
        to_record(object)
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.namespaced(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(&key.to_string(), e))?;
        Ok(())
    }
}
