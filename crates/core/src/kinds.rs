//! Concrete kinds managed by the controllers.

pub use k8s_openapi::api::networking::v1::IPBlock;
use serde::{Deserialize, Serialize};

use crate::meta::{DefaultStatus, Object, Spec, Status};
use crate::Key;

pub type SecretBinding = Object<SecretBindingSpec, DefaultStatus>;
pub type Cluster = Object<ClusterSpec, DefaultStatus>;
pub type Bastion = Object<BastionSpec, BastionStatus>;

// ---- SecretBinding ----

/// Reference to the credentials secret a binding grants access to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Defaults to the binding's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBindingProvider {
    /// Provider types of the clusters using this binding, e.g. `aws`, `gcp`.
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBindingSpec {
    pub secret_ref: SecretRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<SecretBindingProvider>,
}

impl SecretBindingSpec {
    /// Record a provider type; returns true when the spec changed.
    pub fn add_provider_type(&mut self, provider_type: &str) -> bool {
        let provider = self.provider.get_or_insert_with(SecretBindingProvider::default);
        if provider.types.iter().any(|t| t == provider_type) {
            return false;
        }
        provider.types.push(provider_type.to_string());
        true
    }
}

impl Spec for SecretBindingSpec {
    const GROUP: &'static str = "core.steward.io";
    const VERSION: &'static str = "v1beta1";
    const KIND: &'static str = "SecretBinding";
    const PLURAL: &'static str = "secretbindings";
}

impl SecretBinding {
    /// Key of the referenced secret, resolved against the binding's namespace.
    pub fn secret_key(&self) -> Key {
        let ns = self.spec.secret_ref.namespace.clone().or_else(|| self.metadata.namespace.clone());
        Key { namespace: ns, name: self.spec.secret_ref.name.clone() }
    }
}

// ---- Cluster ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProvider {
    #[serde(rename = "type", default)]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Name of the SecretBinding (same namespace) providing cloud credentials.
    #[serde(default)]
    pub secret_binding_name: String,
    #[serde(default)]
    pub provider: ClusterProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Spec for ClusterSpec {
    const GROUP: &'static str = "core.steward.io";
    const VERSION: &'static str = "v1beta1";
    const KIND: &'static str = "Cluster";
    const PLURAL: &'static str = "clusters";
}

impl Cluster {
    /// Key of the SecretBinding this cluster references, if any.
    pub fn secret_binding_key(&self) -> Option<Key> {
        let ns = self.metadata.namespace.as_deref()?;
        if self.spec.secret_binding_name.is_empty() {
            return None;
        }
        Some(Key::namespaced(ns, self.spec.secret_binding_name.as_str()))
    }

    pub fn references_binding(&self, binding: &Key) -> bool {
        self.secret_binding_key().as_ref() == Some(binding)
    }
}

// ---- Bastion ----

/// Source range allowed to reach the bastion, e.g. `203.0.113.0/24`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BastionIngressPolicy {
    #[serde(rename = "ipBlock")]
    pub ip_block: IPBlock,
}

impl BastionIngressPolicy {
    pub fn cidr(cidr: impl Into<String>) -> Self { Self { ip_block: IPBlock { cidr: cidr.into(), except: None } } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    /// Base64-encoded user data provisioning the SSH key on the host.
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub ingress: Vec<BastionIngressPolicy>,
}

impl Spec for BastionSpec {
    const GROUP: &'static str = "extensions.steward.io";
    const VERSION: &'static str = "v1alpha1";
    const KIND: &'static str = "Bastion";
    const PLURAL: &'static str = "bastions";
}

/// Public address of a provisioned bastion host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BastionStatus {
    #[serde(flatten)]
    pub common: DefaultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<BastionIngress>,
}

impl Status for BastionStatus {
    fn common(&self) -> &DefaultStatus { &self.common }
    fn common_mut(&mut self) -> &mut DefaultStatus { &mut self.common }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_resolves_binding_in_own_namespace() {
        let mut c = Cluster::new("garden-dev", "cluster-1", ClusterSpec { secret_binding_name: "binding-1".into(), ..Default::default() });
        assert_eq!(c.secret_binding_key(), Some(Key::namespaced("garden-dev", "binding-1")));
        assert!(c.references_binding(&Key::namespaced("garden-dev", "binding-1")));
        assert!(!c.references_binding(&Key::namespaced("other", "binding-1")));

        c.spec.secret_binding_name.clear();
        assert_eq!(c.secret_binding_key(), None);
    }

    #[test]
    fn bastion_ingress_uses_ip_blocks() {
        let raw = serde_json::json!({
            "apiVersion": "extensions.steward.io/v1alpha1",
            "kind": "Bastion",
            "metadata": { "name": "b1", "namespace": "shoot--dev" },
            "spec": {
                "userData": "IyEvYmluL3NoCg==",
                "ingress": [
                    { "ipBlock": { "cidr": "203.0.113.0/24" } },
                    { "ipBlock": { "cidr": "10.0.0.0/8", "except": ["10.1.0.0/16"] } }
                ]
            }
        });
        let bastion: Bastion = serde_json::from_value(raw).expect("decode");
        assert_eq!(bastion.spec.ingress.len(), 2);
        assert_eq!(bastion.spec.ingress[0].ip_block.cidr, "203.0.113.0/24");
        assert_eq!(bastion.spec.ingress[1].ip_block.except.as_deref(), Some(&["10.1.0.0/16".to_string()][..]));

        let back = serde_json::to_value(&bastion.spec).expect("encode");
        assert_eq!(back["ingress"][0]["ipBlock"]["cidr"], "203.0.113.0/24");
    }

    #[test]
    fn provider_types_are_deduplicated() {
        let mut spec = SecretBindingSpec::default();
        assert!(spec.add_provider_type("aws"));
        assert!(!spec.add_provider_type("aws"));
        assert!(spec.add_provider_type("gcp"));
        assert_eq!(spec.provider.map(|p| p.types), Some(vec!["aws".to_string(), "gcp".to_string()]));
    }

    #[test]
    fn wire_shape_is_kube_like() {
        let b = SecretBinding::new("garden", "b1", SecretBindingSpec { secret_ref: SecretRef { namespace: None, name: "creds".into() }, provider: None });
        let v = serde_json::to_value(&b).expect("encode");
        assert_eq!(v["apiVersion"], "core.steward.io/v1beta1");
        assert_eq!(v["kind"], "SecretBinding");
        assert_eq!(v["spec"]["secretRef"]["name"], "creds");
        let back: SecretBinding = serde_json::from_value(v).expect("decode");
        assert_eq!(back.secret_key(), Key::namespaced("garden", "creds"));
    }
}
