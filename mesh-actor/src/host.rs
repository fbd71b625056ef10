//! Host runtime collaborator traits (spec.md §6 "external interfaces").
//!
//! Grounds on `anda_core::context::CanisterCaller` — a capability trait the
//! core depends on but never implements, supplied by whatever host embeds
//! it (an ICP canister, a test double, ...). `ActorHandle`/`Transport`/
//! `KvStore`/`AlarmHost` follow the same shape: `mesh-actor` depends on
//! them, a deployment (or `mesh-actor::testing` for tests) implements them.

use async_trait::async_trait;
use mesh_core::envelope::CallEnvelope;
use mesh_core::identity::NodeIdentity;
use mesh_core::{BoxError, CallResponse, MeshError};
use std::sync::Arc;

use crate::dispatch::ResultOutcome;

/// A reference to a reachable node, opaque to the dispatcher — resolving
/// `NodeIdentity` to a concrete transport destination is the host's job.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    /// Delivers `envelope` and awaits its `{$result}`/`{$error}` reply
    /// (spec.md §4.4.1 `callRaw`).
    async fn send(&self, envelope: CallEnvelope) -> Result<CallResponse, MeshError>;

    /// Delivers the outcome of a fire-and-forget `call()` to this node's
    /// internal `__handleResult` (spec.md §4.4.4). Modeled as a distinct
    /// operation from [`send`] rather than a chain through the mesh gate,
    /// since the source frames it as an internal method never reachable
    /// from an ordinary entry point.
    async fn deliver_result(&self, req_id: String, outcome: ResultOutcome) -> Result<(), MeshError>;
}

/// Resolves a [`NodeIdentity`] to an [`ActorHandle`] and carries envelopes
/// across whatever boundary separates mesh nodes (process, network, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn resolve(&self, identity: &NodeIdentity) -> Result<Arc<dyn ActorHandle>, MeshError>;
}

/// Durable per-instance storage for a [`crate::actor::StatefulActor`]'s
/// asserted identity and any application state it chooses to persist
/// (spec.md §9 Open Question 1, "initialization race").
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BoxError>;
    async fn delete(&self, key: &str) -> Result<(), BoxError>;
}

/// A single pending alarm, returned by [`AlarmHost::schedule`]; dropping or
/// cancelling it is the "atomic alarm-cancel-vs-fire race" spec.md §4.4.4
/// describes (testable property 12, "timeout/success exclusivity").
#[async_trait]
pub trait AlarmHandle: Send + Sync {
    /// Attempts to cancel the alarm before it fires. Returns `true` if this
    /// call won the race (the alarm will not fire), `false` if the alarm
    /// had already fired (or is firing concurrently).
    async fn cancel(&self) -> bool;
}

/// A callback run when an alarm fires, unless cancelled first.
pub type AlarmCallback = Box<dyn FnOnce() -> futures::future::BoxFuture<'static, ()> + Send>;

/// Schedules a one-shot callback after a delay — the backstop for
/// fire-and-forget calls (spec.md §4.4.4). Not `async` itself: scheduling
/// is expected to be a cheap, synchronous "spawn a timer task" operation.
pub trait AlarmHost: Send + Sync {
    fn schedule(&self, delay_ms: u64, on_fire: AlarmCallback) -> Arc<dyn AlarmHandle>;
}
