use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube_client::{Api, Client};
use kube_core::DynamicObject;

use super::{RawChangeRecord, Selector, SourceError, WatchSource};

/// Watches a resource collection on a Kubernetes apiserver.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, selector: &Selector) -> Api<DynamicObject> {
        match &selector.namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &selector.resource)
            }
            None => Api::all_with(self.client.clone(), &selector.resource),
        }
    }
}

impl WatchSource for KubeWatchSource {
    type Feed = BoxStream<'static, Result<RawChangeRecord, SourceError>>;

    /// Lists one item to learn the collection's current resource version,
    /// then watches from it so that only changes after this call are reported.
    async fn start_watch(&self, selector: &Selector) -> Result<Self::Feed, SourceError> {
        let api = self.api(selector);

        let list = api
            .list(&selector.list_params())
            .await
            .map_err(SourceError::List)?;
        let version = start_version(list.metadata.resource_version)?;

        log::debug!(
            "Watching {} from resource version {version}",
            selector.resource.plural
        );
        let feed = api
            .watch(&selector.watch_params(), &version)
            .await
            .map_err(SourceError::WatchStart)?;

        Ok(feed.map_err(SourceError::Stream).boxed())
    }
}

/// The version to watch from. Watching from "0" or from no version replays
/// every existing object.
fn start_version(resource_version: Option<String>) -> Result<String, SourceError> {
    resource_version
        .filter(|version| !version.is_empty() && version != "0")
        .ok_or(SourceError::NoResourceVersion)
}
