//! Live mid-chain objects (spec.md §4.2 "Get may return a nested object").
//!
//! Split out from `serialize`/`ocan::executor` so both can depend on it
//! without a cycle: a [`Value::Object`](crate::serialize::Value::Object)
//! needs the trait object type, and the executor needs to call through it.
//!
//! Grounds on `anda_core::tool::{ToolDyn, ToolWrapper}`'s dynamic-dispatch
//! split: a static, strongly-typed implementation (not modeled here, left
//! to application code) is wrapped behind a `dyn` trait object the executor
//! can hold in a registry or return from a `Get`.

use crate::chain::Key;
use crate::context::CallContext;
use crate::error::MeshError;
use crate::mesh_marker::MeshRegistry;
use crate::serialize::Value;
use futures::future::BoxFuture;

/// Marks a method as reachable from an incoming chain's first `Apply`
/// (spec.md §4.2.2 "mesh gate").
#[derive(Clone, Default)]
pub struct MeshMarker {
    /// Name surfaced in `NotMeshCallable`/`GuardDenied` diagnostics.
    pub name: String,
}

impl MeshMarker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A callable reachable via `Operation::Apply` against a [`MeshObject`].
pub trait MeshMethod: Send + Sync {
    /// Invoke with pre-resolved arguments (nested markers already
    /// substituted by the executor).
    fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>>;

    /// `Some` if this method may be the first `Apply` of an incoming
    /// chain; `None` means it is only reachable once some other mesh-gated
    /// call has already put the caller "inside" the object (spec.md §4.2.2
    /// capability trust: "everything reachable afterward is trusted").
    fn mesh_marker(&self) -> Option<&MeshMarker> {
        None
    }

    /// A guard evaluated against the ambient `CallContext` when this method
    /// is entered as an incoming chain's first `Apply`. Returning `Err`
    /// surfaces as `MeshError::GuardDenied`. Never re-run for calls reached
    /// afterward via the same chain (spec.md §4.2.2, testable property 5).
    fn check_guard(&self, _ctx: &CallContext) -> Result<(), MeshError> {
        Ok(())
    }
}

/// A live, addressable object reachable mid-chain (e.g. the return value of
/// a prior `Apply`), as opposed to plain data.
///
/// Never appears on the wire: `crate::serialize::preprocess` returns a
/// `SerializationError` if it encounters a `Value::Object`, matching
/// spec.md's framing of such values as execution-local.
pub trait MeshObject: Send + Sync {
    fn get_field(&self, key: &Key) -> Result<Value, MeshError>;
    fn get_method(&self, key: &Key) -> Option<std::sync::Arc<dyn MeshMethod>>;

    /// `true` for the `svc` façade and similar always-reachable service
    /// objects, which skip the mesh gate regardless of marker presence
    /// (spec.md §4.2.2 "unless addressing the svc façade").
    fn bypasses_mesh_gate(&self) -> bool {
        false
    }

    /// An optional table-driven alternative to per-method `check_guard`: a
    /// node binding with several gated methods can keep their names and
    /// guards in one [`MeshRegistry`] instead of overriding `check_guard` on
    /// each `MeshMethod` individually. Consulted at the same point in the
    /// gate as `check_guard` — first `Apply` only — and expects every
    /// mesh-marked method's key to be registered in it, guarded or not.
    fn mesh_registry(&self) -> Option<&MeshRegistry> {
        None
    }
}
