// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Access to the desired state held by the API server.
//!
//! [`DesiredStateSource`] is the seam between the informer and Kubernetes. The
//! production implementation is [`KubeLoggingSource`]; tests drive the
//! informer through in-memory sources.

use crate::error::WatchError;
use crate::model::Logging;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, PostParams, WatchEvent, WatchParams};
use kube::{Client, CustomResourceExt};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const WATCH_TIMEOUT_SECS: u32 = 290;
const CRD_POLL_INTERVAL: Duration = Duration::from_secs(3);
const CRD_READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One change observed on the watch stream.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Applied(Logging),
    Deleted(Logging),
    Bookmark { resource_version: String },
}

/// Result of a full list: every object plus the version to watch from.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<Logging>,
    pub resource_version: String,
}

pub type EventStream = BoxStream<'static, Result<SourceEvent, WatchError>>;

#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Lists every Logging object. Fails with `ResourceNotRegistered` if the type is unknown.
    async fn list(&self) -> Result<Listing, WatchError>;

    async fn get(&self, name: &str) -> Result<Option<Logging>, WatchError>;

    /// Streams changes after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<EventStream, WatchError>;

    /// Registers the Logging resource type and waits until it is served.
    async fn provision(&self) -> Result<(), WatchError>;
}

/// [`DesiredStateSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeLoggingSource {
    client: Client,
    api: Api<Logging>,
}

impl KubeLoggingSource {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client.clone(), namespace),
            client,
        }
    }

    async fn crd_established(
        crds: &Api<CustomResourceDefinition>,
        name: &str,
    ) -> Result<bool, WatchError> {
        let crd = crds.get_opt(name).await.map_err(api_error)?;
        let established = crd
            .and_then(|crd| crd.status)
            .and_then(|status| status.conditions)
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Established" && c.status == "True")
            })
            .unwrap_or(false);
        Ok(established)
    }
}

#[async_trait]
impl DesiredStateSource for KubeLoggingSource {
    async fn list(&self) -> Result<Listing, WatchError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(api_error)?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn get(&self, name: &str) -> Result<Option<Logging>, WatchError> {
        self.api.get_opt(name).await.map_err(api_error)
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream, WatchError> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .api
            .watch(&params, resource_version)
            .await
            .map_err(api_error)?;

        Ok(stream
            .map(|event| match event {
                Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj)) => {
                    Ok(SourceEvent::Applied(obj))
                }
                Ok(WatchEvent::Deleted(obj)) => Ok(SourceEvent::Deleted(obj)),
                Ok(WatchEvent::Bookmark(bookmark)) => Ok(SourceEvent::Bookmark {
                    resource_version: bookmark.metadata.resource_version,
                }),
                Ok(WatchEvent::Error(e)) if e.code == 410 => Err(WatchError::Expired),
                Ok(WatchEvent::Error(e)) => Err(WatchError::Stream(e.message)),
                Err(e) => Err(WatchError::Stream(e.to_string())),
            })
            .boxed())
    }

    async fn provision(&self) -> Result<(), WatchError> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = Logging::crd();
        let name = Logging::crd_name();

        match crds.create(&PostParams::default(), &crd).await {
            Ok(_) => info!("registered custom resource {name}"),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!("custom resource {name} already registered")
            }
            Err(e) => return Err(WatchError::Api(e.to_string())),
        }

        let deadline = Instant::now() + CRD_READY_TIMEOUT;
        loop {
            if Self::crd_established(&crds, name).await? {
                info!("custom resource {name} is established");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WatchError::Api(format!(
                    "custom resource {name} not established after {CRD_READY_TIMEOUT:?}"
                )));
            }
            sleep(CRD_POLL_INTERVAL).await;
        }
    }
}

fn api_error(e: kube::Error) -> WatchError {
    match e {
        kube::Error::Api(response) if response.code == 404 => WatchError::ResourceNotRegistered,
        kube::Error::Api(response) if response.code == 410 => WatchError::Expired,
        other => WatchError::Api(other.to_string()),
    }
}
