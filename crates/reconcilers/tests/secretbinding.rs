use std::sync::Arc;
use std::time::Duration;

use steward_core::{
    ClientError, Cluster, ClusterProvider, ClusterSpec, Condition, ConditionStatus, DefaultStatus, Key, Outcome, SecretBinding,
    SecretBindingSpec, SecretRef,
};
use steward_kubehub::{MemoryStore, ResourceClient};
use steward_reconcilers::{SecretBindingReconciler, UsageIndex, SECRET_BINDING_FINALIZER};
use steward_runtime::Reconciler;

type Bindings = MemoryStore<SecretBindingSpec, DefaultStatus>;
type Clusters = MemoryStore<ClusterSpec, DefaultStatus>;

const BLOCKED: Duration = Duration::from_secs(15);

struct Fixture {
    bindings: Arc<Bindings>,
    clusters: Arc<Clusters>,
    usage: Arc<UsageIndex>,
    reconciler: SecretBindingReconciler,
}

fn fixture() -> Fixture {
    let bindings = Arc::new(Bindings::new());
    let clusters = Arc::new(Clusters::new());
    let usage = Arc::new(UsageIndex::new());
    let reconciler = SecretBindingReconciler::new(bindings.clone(), clusters.informer(), usage.clone(), BLOCKED);
    Fixture { bindings, clusters, usage, reconciler }
}

fn binding(name: &str, secret: &str) -> SecretBinding {
    SecretBinding::new("garden", name, SecretBindingSpec { secret_ref: SecretRef { namespace: None, name: secret.into() }, provider: None })
}

fn cluster(name: &str, binding: &str) -> Cluster {
    Cluster::new(
        "garden",
        name,
        ClusterSpec { secret_binding_name: binding.into(), provider: ClusterProvider { type_: "aws".into() }, region: None },
    )
}

#[tokio::test]
async fn created_binding_gets_finalizer_and_ready_status() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");

    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);

    let stored = fx.bindings.peek(&key).expect("present");
    assert!(stored.metadata.has_finalizer(SECRET_BINDING_FINALIZER));
    assert_eq!(stored.status.observed_generation, stored.metadata.generation);
    let ready = stored.status.condition(Condition::READY).expect("ready condition");
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(fx.usage.users_of(&Key::namespaced("garden", "creds")), vec![key.clone()]);

    let writes = fx.bindings.writes();
    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
    assert_eq!(fx.bindings.writes(), writes, "converged binding was written again");
}

#[tokio::test]
async fn deletion_waits_for_referencing_clusters() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");
    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);

    fx.clusters.create(cluster("cluster-1", "binding-1")).expect("cluster");
    fx.bindings.delete(&key).await.expect("delete");

    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::RequeueAfter(BLOCKED));
    let blocked = fx.bindings.peek(&key).expect("still present");
    assert!(blocked.metadata.has_finalizer(SECRET_BINDING_FINALIZER));
    let ready = blocked.status.condition(Condition::READY).expect("condition");
    assert_eq!(ready.reason, "DeletionBlocked");
    assert!(ready.message.contains("cluster-1"));

    fx.clusters.delete(&Key::namespaced("garden", "cluster-1")).await.expect("delete cluster");

    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
    assert!(fx.bindings.peek(&key).is_none());
    assert!(!fx.usage.is_in_use(&Key::namespaced("garden", "creds")));
}

#[tokio::test]
async fn clusters_of_other_bindings_do_not_block() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");
    fx.reconciler.reconcile(&key).await;
    fx.clusters.create(cluster("cluster-2", "binding-2")).expect("cluster");

    fx.bindings.delete(&key).await.expect("delete");
    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
    assert!(fx.bindings.peek(&key).is_none());
}

#[tokio::test]
async fn object_deleted_before_fetch_needs_no_writes() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");
    fx.bindings.delete(&key).await.expect("delete");
    let writes = fx.bindings.writes();

    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
    assert_eq!(fx.bindings.writes(), writes);
}

#[tokio::test]
async fn empty_secret_name_is_terminal_and_reported() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "")).expect("create");

    assert!(matches!(fx.reconciler.reconcile(&key).await, Outcome::Terminal(_)));

    let stored = fx.bindings.peek(&key).expect("present");
    assert!(!stored.metadata.has_finalizer(SECRET_BINDING_FINALIZER));
    assert_eq!(stored.status.observed_generation, 0);
    let ready = stored.status.condition(Condition::READY).expect("condition");
    assert_eq!((ready.status, ready.reason.as_str()), (ConditionStatus::False, "InvalidSpec"));
    assert!(stored.status.last_error.is_some());
}

#[tokio::test]
async fn binding_turned_invalid_stops_using_its_secret() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");
    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
    assert!(fx.usage.is_in_use(&Key::namespaced("garden", "creds")));

    let mut edited = fx.bindings.peek(&key).expect("present");
    edited.spec.secret_ref.name.clear();
    fx.bindings.update(&edited).await.expect("edit");

    assert!(matches!(fx.reconciler.reconcile(&key).await, Outcome::Terminal(_)));
    assert!(!fx.usage.is_in_use(&Key::namespaced("garden", "creds")));
}

#[tokio::test]
async fn transient_client_errors_are_retryable() {
    let fx = fixture();
    let key = Key::namespaced("garden", "binding-1");
    fx.bindings.create(binding("binding-1", "creds")).expect("create");

    fx.bindings.fail_next(ClientError::Transient("connection reset".into()));
    assert!(matches!(fx.reconciler.reconcile(&key).await, Outcome::Retryable(_)));

    // A stale write surfaces as a conflict, which is retried as well.
    fx.bindings.fail_next(ClientError::Conflict("stale".into()));
    assert!(matches!(fx.reconciler.reconcile(&key).await, Outcome::Retryable(_)));

    assert_eq!(fx.reconciler.reconcile(&key).await, Outcome::Success);
}
