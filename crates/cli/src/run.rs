//! `stewardctl run`: wire watch sources, queues, translators and reconcilers
//! against the cluster and run until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use steward_core::{
    Bastion, BastionSpec, BastionStatus, Cluster, ClusterSpec, DefaultStatus, Object, SecretBinding, SecretBindingSpec, Spec, Status,
};
use steward_kubehub::{run_watcher, Informer, KubeResourceClient, SharedInformer};
use steward_queue::controller_rate_limiter;
use steward_reconcilers::{
    pools, BastionReconciler, ProviderSyncReconciler, SecretBindingReconciler, StaticIngressActuator, UsageIndex,
};
use steward_runtime::{Controller, CrossTrigger, EnqueueOwnKey, KeyQueue};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Settings;

fn spawn_watcher<S: Spec, T: Status>(
    client: kube::Client,
    namespace: Option<String>,
    informer: Arc<SharedInformer<Object<S, T>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_watcher::<S, T>(client, namespace.as_deref(), informer).await {
            error!(kind = S::KIND, error = ?e, "watcher failed");
        }
    })
}

pub(crate) async fn run(settings: Settings) -> Result<()> {
    let client = steward_kubehub::connect().await?;
    info!(ns = ?settings.namespace, "starting controllers");

    let binding_source: Arc<SharedInformer<SecretBinding>> = Arc::new(SharedInformer::new());
    let cluster_source: Arc<SharedInformer<Cluster>> = Arc::new(SharedInformer::new());
    let bastion_source: Arc<SharedInformer<Bastion>> = Arc::new(SharedInformer::new());
    let watchers = vec![
        spawn_watcher::<SecretBindingSpec, DefaultStatus>(client.clone(), settings.namespace.clone(), binding_source.clone()),
        spawn_watcher::<ClusterSpec, DefaultStatus>(client.clone(), settings.namespace.clone(), cluster_source.clone()),
        spawn_watcher::<BastionSpec, BastionStatus>(client.clone(), settings.namespace.clone(), bastion_source.clone()),
    ];

    let queue = |name: &str| KeyQueue::new(name, controller_rate_limiter(settings.backoff_base(), settings.backoff_max()));
    let binding_queue = queue(pools::SECRET_BINDING);
    let provider_queue = queue(pools::SECRET_BINDING_PROVIDER);
    let bastion_queue = queue(pools::BASTION);

    binding_source.add_event_handler(Arc::new(EnqueueOwnKey::new(binding_queue.clone())));
    cluster_source.add_event_handler(Arc::new(CrossTrigger::new(binding_queue.clone(), Cluster::secret_binding_key)));
    cluster_source.add_event_handler(Arc::new(EnqueueOwnKey::adds_only(provider_queue.clone())));
    bastion_source.add_event_handler(Arc::new(EnqueueOwnKey::new(bastion_queue.clone())));

    let bindings = Arc::new(KubeResourceClient::<SecretBindingSpec, DefaultStatus>::new(client.clone()));
    let clusters = Arc::new(KubeResourceClient::<ClusterSpec, DefaultStatus>::new(client.clone()));
    let bastions = Arc::new(KubeResourceClient::<BastionSpec, BastionStatus>::new(client));

    let binding_reconciler =
        SecretBindingReconciler::new(bindings.clone(), cluster_source.clone(), Arc::new(UsageIndex::new()), settings.blocked_requeue());
    let provider_reconciler = ProviderSyncReconciler::new(clusters, bindings);
    let bastion_reconciler = BastionReconciler::new(bastions, Arc::new(StaticIngressActuator::new(settings.bastion_domain.clone())));

    let controller = Controller::new("steward", settings.runtime.clone())
        .watches(binding_source)
        .watches(cluster_source)
        .watches(bastion_source)
        .register(pools::SECRET_BINDING, binding_queue, Arc::new(binding_reconciler))
        .register(pools::SECRET_BINDING_PROVIDER, provider_queue, Arc::new(provider_reconciler))
        .register(pools::BASTION, bastion_queue, Arc::new(bastion_reconciler));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; draining"),
                Err(e) => error!(error = %e, "failed to listen for interrupt; shutting down"),
            }
            cancel.cancel();
        }
    });

    let result = controller.start(cancel, settings.workers.clone()).await.context("running controllers");
    for w in watchers {
        w.abort();
    }
    info!("stopped");
    result
}
