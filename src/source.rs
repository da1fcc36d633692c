//! Upstream feeds of raw change records.

use std::future::Future;

use futures::Stream;
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube_core::{
    params::{ListParams, WatchParams},
    ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent,
};

pub mod kube;
pub use self::kube::KubeWatchSource;

/// One notification from the upstream feed, before normalization.
pub type RawChangeRecord = WatchEvent<DynamicObject>;

/// Identifies the resource collection a feed watches.
#[derive(Debug, Clone)]
pub struct Selector {
    pub resource: ApiResource,
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Server-side watch timeout in seconds.
    pub timeout: Option<u32>,
}

impl Selector {
    pub fn new(resource: ApiResource) -> Self {
        Self {
            resource,
            namespace: None,
            label_selector: None,
            field_selector: None,
            timeout: None,
        }
    }

    /// Core `v1/Event` objects in all namespaces.
    pub fn core_events() -> Self {
        Self::new(ApiResource::erase::<CoreEvent>(&()))
    }

    /// Selects a collection by group, version and kind.
    ///
    /// The plural is guessed from the kind unless given explicitly.
    pub fn from_gvk(group: &str, version: &str, kind: &str, plural: Option<&str>) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = match plural {
            Some(plural) => ApiResource::from_gvk_with_plural(&gvk, plural),
            None => ApiResource::from_gvk(&gvk),
        };
        Self::new(resource)
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn labels(mut self, label_selector: impl Into<String>) -> Self {
        self.label_selector = Some(label_selector.into());
        self
    }

    pub fn fields(mut self, field_selector: impl Into<String>) -> Self {
        self.field_selector = Some(field_selector.into());
        self
    }

    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub(crate) fn list_params(&self) -> ListParams {
        let mut params = ListParams::default().limit(1);
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }

    pub(crate) fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        if let Some(timeout) = self.timeout {
            params = params.timeout(timeout);
        }
        params
    }
}

/// A restartable feed of raw change records.
///
/// Each call to [`start_watch`](Self::start_watch) establishes a fresh feed.
/// The feed yields records in the order the upstream produced them
/// until it fails or ends; both are terminal for that feed.
pub trait WatchSource: Send + Sync + 'static {
    type Feed: Stream<Item = Result<RawChangeRecord, SourceError>> + Send + Unpin + 'static;

    fn start_watch(
        &self,
        selector: &Selector,
    ) -> impl Future<Output = Result<Self::Feed, SourceError>> + Send;
}

/// Terminal failures of an upstream feed.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to list the watched collection: {0}")]
    List(#[source] kube_client::Error),
    #[error("failed to start watching: {0}")]
    WatchStart(#[source] kube_client::Error),
    #[error("watch stream failed: {0}")]
    Stream(#[source] kube_client::Error),
    #[error("error returned by apiserver during watch: {0}")]
    Api(ErrorResponse),
    #[error("list response carried no resource version to watch from")]
    NoResourceVersion,
}
