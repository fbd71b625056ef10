//! Node identity (spec.md §3 `NodeIdentity`).
//!
//! Grounded on `anda_core::context::StateFeatures` / `anda_engine::context::base::BaseCtx`,
//! which carry the same "who is this, who called it" fields (`id`, `user`, `caller`)
//! generalized here to an addressable mesh node.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The three kinds of node that can appear in a [`NodeIdentity`] (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum NodeKind {
    /// A persistent, addressable actor instance.
    Stateful,
    /// An addressable binding without a persistent instance.
    Stateless,
    /// An authenticated external client, asserted only by the gateway.
    Client,
}

/// `{ kind, bindingName, instanceName? }` from spec.md §3.
///
/// `instance_name` is always `None` for [`NodeKind::Stateless`]; for
/// [`NodeKind::Stateful`] it is either a caller-chosen name or a 64-hex
/// globally-unique id (see [`NodeIdentity::generate_instance_id`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub kind: NodeKind,
    pub binding_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl NodeIdentity {
    pub fn stateful(binding_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Stateful,
            binding_name: binding_name.into(),
            instance_name: Some(instance_name.into()),
        }
    }

    /// A stateful identity whose instance name has not been asserted yet.
    pub fn stateful_unnamed(binding_name: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Stateful,
            binding_name: binding_name.into(),
            instance_name: None,
        }
    }

    pub fn stateless(binding_name: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Stateless,
            binding_name: binding_name.into(),
            instance_name: None,
        }
    }

    pub fn client(client_id: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Client,
            binding_name: client_id.into(),
            instance_name: None,
        }
    }

    /// A 64-hex globally-unique instance id, used when the caller does not
    /// assert a human-chosen `instanceName` (spec.md §3).
    pub fn generate_instance_id() -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let mut out = String::with_capacity(64);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn is_stateful(&self) -> bool {
        self.kind == NodeKind::Stateful
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance_name {
            Some(name) => write!(f, "{:?}:{}/{}", self.kind, self.binding_name, name),
            None => write!(f, "{:?}:{}", self.kind, self.binding_name),
        }
    }
}
