//! Call envelope, wire format v1 (spec.md §6).
//!
//! Grounds on `anda_engine_server`'s request/response wrapper shape
//! (version tag + payload + routing metadata) generalized to carry an OCAN
//! chain plus a plain-JSON call context.

use crate::context::CallContext;
use crate::error::MeshError;
use crate::identity::NodeIdentity;
use crate::serialize::{Wire, WireChain, WireError};
use serde::{Deserialize, Serialize};

/// Current, and only, supported envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// `{ callee, caller }` — routing metadata alongside the envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub callee: NodeIdentity,
    pub caller: NodeIdentity,
}

/// The wire format for a single mesh call (spec.md §6): a serialized
/// operation chain, a plain-JSON call context, and routing metadata.
///
/// Fully `serde`-derivable: `WireChain` is the flattened form of
/// `OperationChain` and `CallContext` is already plain-JSON-shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub version: u32,
    pub chain: WireChain,
    pub call_context: CallContext,
    pub metadata: EnvelopeMetadata,
}

impl CallEnvelope {
    pub fn new(
        chain: WireChain,
        call_context: CallContext,
        callee: NodeIdentity,
        caller: NodeIdentity,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            chain,
            call_context,
            metadata: EnvelopeMetadata { callee, caller },
        }
    }

    /// Rejects anything but the version this build understands
    /// (spec.md §7 `UnsupportedEnvelope`).
    pub fn check_version(&self) -> Result<(), MeshError> {
        if self.version == ENVELOPE_VERSION {
            Ok(())
        } else {
            Err(MeshError::UnsupportedEnvelope(self.version))
        }
    }
}

/// Reply to a `call_raw`/incoming-envelope dispatch (spec.md §6): a
/// `{"$result": ...}` success wrapper or a `{"$error": ...}` failure
/// wrapper. DESIGN.md's Open Question resolution #2 keeps this wrapper
/// rather than relying on the transport to preserve a typed throw, since
/// `mesh-actor`'s own `Transport` is plain data in, data out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallResponse {
    #[serde(rename = "$result")]
    Result(Wire),
    #[serde(rename = "$error")]
    Error(WireError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Key, OperationChain};
    use crate::serialize::preprocess_chain;

    #[test]
    fn round_trips_through_json() {
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("ping".into()));
        chain.push_apply(vec![]);

        let envelope = CallEnvelope::new(
            preprocess_chain(&chain).unwrap(),
            CallContext::new_origin(NodeIdentity::client("c1")),
            NodeIdentity::stateless("svc.ping"),
            NodeIdentity::client("c1"),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        let back: CallEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, ENVELOPE_VERSION);
        assert!(back.check_version().is_ok());
    }

    #[test]
    fn rejects_future_version() {
        let mut envelope = CallEnvelope::new(
            Vec::new(),
            CallContext::new_origin(NodeIdentity::client("c1")),
            NodeIdentity::stateless("svc.ping"),
            NodeIdentity::client("c1"),
        );
        envelope.version = 2;
        assert!(matches!(
            envelope.check_version(),
            Err(MeshError::UnsupportedEnvelope(2))
        ));
    }
}
