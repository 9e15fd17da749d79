//! Kube-backed implementations: a typed client over `Api<DynamicObject>` and
//! a list+watch loop feeding a [`SharedInformer`].

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use steward_core::{ClientError, Key, Object, Resource, Spec, Status};
use tracing::{debug, info, warn};

use crate::informer::{SharedInformer, WatchEvent};
use crate::ResourceClient;

fn api_resource<S: Spec>() -> ApiResource {
    let gvk = GroupVersionKind::gvk(S::GROUP, S::VERSION, S::KIND);
    ApiResource::from_gvk_with_plural(&gvk, S::PLURAL)
}

fn dynamic_api(client: Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, resource),
        None => Api::all_with(client, resource),
    }
}

/// Map an API failure onto the client error taxonomy. Anything that is not
/// an API status (connect, TLS, timeouts) is treated as transient.
fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 | 410 => ClientError::NotFound(resp.message),
            409 => ClientError::Conflict(resp.message),
            400 | 422 => ClientError::Invalid(resp.message),
            429 | 500..=599 => ClientError::Transient(resp.message),
            _ => ClientError::Other(format!("{} ({})", resp.message, resp.code)),
        },
        other => ClientError::Transient(other.to_string()),
    }
}

fn decode<S: Spec, T: Status>(obj: DynamicObject) -> Result<Object<S, T>, ClientError> {
    serde_json::to_value(&obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ClientError::Other(format!("decoding {}: {}", S::KIND, e)))
}

fn encode<S: Spec, T: Status>(obj: &Object<S, T>) -> Result<DynamicObject, ClientError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ClientError::Other(format!("encoding {}: {}", S::KIND, e)))
}

/// Typed access to one kind through the Kubernetes API.
pub struct KubeResourceClient<S, T> {
    client: Client,
    resource: ApiResource,
    _kind: PhantomData<fn() -> (S, T)>,
}

impl<S: Spec, T: Status> KubeResourceClient<S, T> {
    pub fn new(client: Client) -> Self {
        Self { client, resource: api_resource::<S>(), _kind: PhantomData }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        dynamic_api(self.client.clone(), &self.resource, namespace)
    }
}

#[async_trait]
impl<S: Spec, T: Status> ResourceClient<Object<S, T>> for KubeResourceClient<S, T> {
    async fn get(&self, key: &Key) -> Result<Object<S, T>, ClientError> {
        match self.api(key.namespace()).get_opt(&key.name).await.map_err(classify)? {
            Some(obj) => decode(obj),
            None => Err(ClientError::NotFound(format!("{} {}", S::KIND, key))),
        }
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Object<S, T>>, ClientError> {
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(classify)?;
        list.items.into_iter().map(decode::<S, T>).collect()
    }

    async fn update(&self, obj: &Object<S, T>) -> Result<Object<S, T>, ClientError> {
        let key = obj.key();
        let data = encode(obj)?;
        let out = self.api(key.namespace()).replace(&key.name, &PostParams::default(), &data).await.map_err(classify)?;
        decode(out)
    }

    async fn update_status(&self, obj: &Object<S, T>) -> Result<Object<S, T>, ClientError> {
        let key = obj.key();
        let body = serde_json::to_vec(obj).map_err(|e| ClientError::Other(format!("encoding {} status: {}", S::KIND, e)))?;
        let out = self.api(key.namespace()).replace_status(&key.name, &PostParams::default(), body).await.map_err(classify)?;
        decode(out)
    }

    async fn delete(&self, key: &Key) -> Result<(), ClientError> {
        self.api(key.namespace()).delete(&key.name, &DeleteParams::default()).await.map_err(classify)?;
        Ok(())
    }
}

fn decode_logged<S: Spec, T: Status>(obj: DynamicObject) -> Option<Object<S, T>> {
    match decode(obj) {
        Ok(o) => Some(o),
        Err(e) => {
            warn!(kind = S::KIND, error = %e, "skipping undecodable object");
            counter!("watch_decode_errors_total", 1u64, "kind" => S::KIND);
            None
        }
    }
}

/// List+watch one kind and feed the informer. Watch errors are retried with
/// backoff; returns when the stream ends.
pub async fn run_watcher<S: Spec, T: Status>(
    client: Client,
    namespace: Option<&str>,
    informer: Arc<SharedInformer<Object<S, T>>>,
) -> Result<()> {
    let api = dynamic_api(client, &api_resource::<S>(), namespace);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = S::KIND, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(o)) => {
                if let Some(obj) = decode_logged(o) {
                    informer.apply(WatchEvent::Applied(obj));
                }
            }
            Ok(Event::Deleted(o)) => {
                if let Some(obj) = decode_logged(o) {
                    informer.apply(WatchEvent::Deleted(obj));
                }
            }
            Ok(Event::Restarted(list)) => {
                debug!(kind = S::KIND, count = list.len(), "watch restart");
                let objs = list.into_iter().filter_map(decode_logged::<S, T>).collect();
                informer.apply(WatchEvent::Restarted(objs));
            }
            Err(e) => {
                warn!(kind = S::KIND, error = %e, "watch error; backing off");
                counter!("watch_errors_total", 1u64, "kind" => S::KIND);
            }
        }
    }
    warn!(kind = S::KIND, "watcher stream ended");
    Ok(())
}
