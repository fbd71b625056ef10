//! Mesh-callable registration (spec.md §4.2.2 "mesh gate").
//!
//! Grounds on `anda_core::tool::ToolSet`'s `BTreeMap<String, Box<dyn
//! ToolDyn<C>>>` registry, generalized from "every registered tool is
//! callable" to "a method is reachable from an incoming chain's first
//! `Apply` only if explicitly registered here, optionally behind a guard".

use crate::context::CallContext;
use crate::error::MeshError;
use std::collections::HashMap;
use std::sync::Arc;

/// Re-evaluated against the ambient [`CallContext`] every time a mesh-gated
/// method is entered from outside (spec.md §4.2.2). `Err` surfaces as
/// `MeshError::GuardDenied`.
pub type Guard = Arc<dyn Fn(&CallContext) -> Result<(), MeshError> + Send + Sync>;

/// Per-node-binding table of which method names are mesh-callable, and
/// under what guard.
///
/// A node binding (an actor/worker implementation) owns one of these and
/// consults it only for the first `Apply` of an incoming chain — once past
/// that gate, the executor trusts whatever is reachable next (testable
/// property 5, "capability trust").
#[derive(Clone, Default)]
pub struct MeshRegistry {
    entries: HashMap<String, Option<Guard>>,
}

impl MeshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` mesh-callable, unconditionally.
    pub fn mesh(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), None);
        self
    }

    /// Marks `name` mesh-callable behind `guard`.
    pub fn mesh_guarded(mut self, name: impl Into<String>, guard: Guard) -> Self {
        self.entries.insert(name.into(), Some(guard));
        self
    }

    pub fn is_mesh_callable(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Enforces the gate for `name`: `NotMeshCallable` if unregistered,
    /// otherwise the registered guard's verdict (or `Ok` if unguarded).
    pub fn check(&self, name: &str, ctx: &CallContext) -> Result<(), MeshError> {
        match self.entries.get(name) {
            None => Err(MeshError::NotMeshCallable {
                target: name.to_string(),
            }),
            Some(None) => Ok(()),
            Some(Some(guard)) => guard(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;

    #[test]
    fn unregistered_method_is_rejected() {
        let registry = MeshRegistry::new().mesh("add");
        let ctx = CallContext::new_origin(NodeIdentity::client("c1"));
        assert!(registry.check("add", &ctx).is_ok());
        assert!(matches!(
            registry.check("secret", &ctx),
            Err(MeshError::NotMeshCallable { .. })
        ));
    }

    #[test]
    fn guard_can_deny() {
        let registry = MeshRegistry::new().mesh_guarded(
            "admin",
            Arc::new(|_ctx: &CallContext| Err(MeshError::GuardDenied("not an admin".into()))),
        );
        let ctx = CallContext::new_origin(NodeIdentity::client("c1"));
        assert!(matches!(
            registry.check("admin", &ctx),
            Err(MeshError::GuardDenied(_))
        ));
    }
}
