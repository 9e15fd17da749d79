//! Lifecycle shape shared by every managed kind: type tag, identity metadata,
//! desired spec and observed status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Key;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

/// Identity and bookkeeping metadata. Fields this crate does not model
/// (annotations, owner references, managed fields, ...) are carried in
/// `extra` so writes do not drop them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ObjectMeta {
    pub fn key(&self) -> Key {
        Key { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Deletion was requested; spec is frozen and only finalization may run.
    pub fn is_deleting(&self) -> bool { self.deletion_timestamp.is_some() }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true when the finalizer was not present before.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true when the finalizer was present before.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub const READY: &'static str = "Ready";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Status fields common to all extension kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl DefaultStatus {
    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Upsert a condition. The transition time only moves when the status
    /// flips, so re-asserting an unchanged condition leaves the status equal.
    pub fn set_condition(&mut self, kind: &str, status: ConditionStatus, reason: &str, message: &str) {
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(c) => {
                if c.status != status {
                    c.status = status;
                    c.last_transition_time = Some(Utc::now());
                }
                c.reason = reason.to_string();
                c.message = message.to_string();
            }
            None => self.conditions.push(Condition {
                kind: kind.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Some(Utc::now()),
            }),
        }
    }

    pub fn set_last_error(&mut self, description: &str) {
        if self.last_error.as_ref().map(|e| e.description.as_str()) == Some(description) {
            return;
        }
        self.last_error = Some(LastError { description: description.to_string(), last_update_time: Some(Utc::now()) });
    }

    pub fn clear_last_error(&mut self) { self.last_error = None; }
}

/// Desired state of one kind. The constants address the kind in the backing store.
pub trait Spec: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const GROUP: &'static str;
    const VERSION: &'static str;
    const KIND: &'static str;
    const PLURAL: &'static str;
}

/// Observed state of one kind; always embeds [`DefaultStatus`].
pub trait Status: Clone + Default + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn common(&self) -> &DefaultStatus;
    fn common_mut(&mut self) -> &mut DefaultStatus;
}

impl Status for DefaultStatus {
    fn common(&self) -> &DefaultStatus { self }
    fn common_mut(&mut self) -> &mut DefaultStatus { self }
}

/// A typed extension resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize, T: Serialize", deserialize = "S: Spec, T: Status"))]
pub struct Object<S, T> {
    #[serde(flatten)]
    pub types: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: T,
}

impl<S: Spec, T: Status> Object<S, T> {
    pub fn new(namespace: &str, name: &str, spec: S) -> Self {
        Self {
            types: TypeMeta { api_version: Self::api_version(), kind: S::KIND.to_string() },
            metadata: ObjectMeta { namespace: Some(namespace.to_string()), name: name.to_string(), ..Default::default() },
            spec,
            status: T::default(),
        }
    }

    pub fn api_version() -> String {
        if S::GROUP.is_empty() { S::VERSION.to_string() } else { format!("{}/{}", S::GROUP, S::VERSION) }
    }
}

/// Anything the watch and client layers can address by key.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    fn kind() -> &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn key(&self) -> Key { self.meta().key() }
}

impl<S: Spec, T: Status> Resource for Object<S, T> {
    fn kind() -> &'static str { S::KIND }
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}
