//! Actor base types (spec.md §4.5, component C5).
//!
//! Grounds on `anda_engine::engine::Engine` (named dispatch target built by
//! an `EngineBuilder`) and `anda_engine::context::agent::AgentCtx` (an
//! `lmz`-style façade bundling the base context with lazily-resolved
//! registries), generalized from "one engine instance wraps tool/agent
//! registries" to "one actor instance wraps its identity and mesh-gated
//! methods".

use mesh_core::identity::NodeIdentity;
use mesh_core::object::MeshObject;
use mesh_core::{CallContext, ExecutorConfig, MeshError};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::Dispatcher;
use crate::host::KvStore;

const KEY_BINDING_NAME: &str = "binding_name";
const KEY_INSTANCE_NAME: &str = "instance_name";

/// Per-node-instance façade mirroring the source's `lmz.*` surface
/// (spec.md §4.5): identity, the ambient call context, and the outgoing
/// dispatch operations (`call`, `call_raw`).
#[derive(Clone)]
pub struct Lmz {
    pub(crate) dispatcher: Dispatcher,
}

impl Lmz {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// `None` for a stateful actor whose identity has not been asserted yet.
    pub fn binding_name(&self) -> Option<String> {
        self.dispatcher.self_identity().map(|i| i.binding_name)
    }

    pub fn instance_name(&self) -> Option<String> {
        self.dispatcher
            .self_identity()
            .and_then(|i| i.instance_name)
    }

    /// The ambient call context of the handler currently executing on this
    /// node (spec.md §4.3 `currentCallContext()`).
    pub fn call_context(&self) -> Result<CallContext, MeshError> {
        mesh_core::context::current_call_context()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Lazily-constructed, per-node-instance plugin façade (spec.md §6 "Plugin
/// registration", SPEC_FULL.md §3 "Plugin/service façade `svc.<name>`").
///
/// Grounded on `anda_engine`'s `Hooks`/`AgentCtx` composition: a registry of
/// named factories, each invoked at most once per node instance and its
/// result memoized.
pub struct ServiceRegistry {
    factories: HashMap<String, Box<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>>,
    memo: parking_lot::Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            memo: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Registers a named service factory `() -> T`.
    pub fn register<T, F>(&mut self, name: impl Into<String>, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories.insert(
            name.into(),
            Box::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>),
        );
    }

    /// Resolves `name`, constructing and memoizing it on first access.
    /// `ServiceNotFound` if no factory was registered (spec.md §6).
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, MeshError> {
        if let Some(existing) = self.memo.lock().get(name) {
            return downcast(existing.clone(), name);
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| MeshError::ServiceNotFound(name.to_string()))?;
        let built = factory();
        self.memo.lock().insert(name.to_string(), built.clone());
        downcast(built, name)
    }
}

fn downcast<T: Send + Sync + 'static>(
    value: Arc<dyn Any + Send + Sync>,
    name: &str,
) -> Result<Arc<T>, MeshError> {
    value
        .downcast::<T>()
        .map_err(|_| MeshError::ServiceNotFound(format!("{name} (type mismatch)")))
}

/// Assembles a node's dispatch scaffolding before it is usable: identity
/// (or none, for a stateful actor awaiting auto-init), executor tunables
/// and registered `svc.<name>` services (spec.md §6, mirrors
/// `anda_engine::engine::Engine::builder()`'s consuming, `with_*`-chained
/// construction).
pub struct MeshActorBuilder {
    identity: Option<NodeIdentity>,
    executor_config: ExecutorConfig,
    services: ServiceRegistry,
}

impl Default for MeshActorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshActorBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            executor_config: ExecutorConfig::default(),
            services: ServiceRegistry::new(),
        }
    }

    /// Fixes this node's identity up front — a stateless worker's
    /// permanent binding, or a stateful actor's identity restored from
    /// storage at startup. Leave unset for a fresh stateful actor that
    /// will auto-init from its first incoming envelope (spec.md §4.4.5).
    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Registers a named service factory, resolved lazily through the
    /// `svc.<name>` façade (spec.md §4.5, §6 "Plugin registration").
    pub fn register_service<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.services.register(name, factory);
        self
    }

    /// Wires the accumulated configuration to a host's [`Transport`]/
    /// [`crate::host::AlarmHost`] and produces the `lmz`/`svc` façades an
    /// actor implementation holds (spec.md §4.5).
    pub fn build(
        self,
        transport: Arc<dyn crate::host::Transport>,
        alarms: Arc<dyn crate::host::AlarmHost>,
    ) -> (Lmz, ServiceRegistry) {
        let dispatcher = Dispatcher::new(self.identity, transport, alarms, self.executor_config);
        (Lmz::new(dispatcher), self.services)
    }
}

/// A persistent, addressable actor instance (spec.md GLOSSARY).
///
/// Identity is single-assignment: the first caller to assert it (auto-init
/// on the first incoming envelope via [`Dispatcher::assert_identity`], or an
/// explicit [`StatefulActor::init_identity`] call) wins; every later
/// assertion of a *different* identity fails `IdentityMismatch` (spec.md
/// §4.4.5, §9 Open Question 1 — single-threaded per-instance dispatch is
/// what makes "first writer always wins" sound without an additional
/// in-memory lock).
pub trait StatefulActor: MeshObject + Send + Sync + 'static {
    /// Durable storage for this instance's identity (and whatever
    /// application state it chooses to persist under its own keys).
    fn kv(&self) -> &dyn KvStore;

    fn lmz(&self) -> &Lmz;

    /// Explicitly asserts an identity (as opposed to the implicit auto-init
    /// path in [`Dispatcher::assert_identity`], driven by an incoming
    /// envelope's `metadata.callee`).
    async fn init_identity(
        &self,
        binding_name: &str,
        instance_name: Option<&str>,
    ) -> Result<(), MeshError> {
        self.lmz()
            .dispatcher()
            .assert_identity(binding_name, instance_name)?;
        self.persist_identity().await
    }

    /// Writes the dispatcher's current identity to [`kv`]; called after
    /// every successful assertion (explicit or auto-init) so a restart can
    /// restore it via [`load_identity`].
    async fn persist_identity(&self) -> Result<(), MeshError> {
        if let Some(identity) = self.lmz().dispatcher().self_identity() {
            self.kv()
                .put(KEY_BINDING_NAME, identity.binding_name.into_bytes())
                .await
                .map_err(|e| MeshError::NotAuthorized(e.to_string()))?;
            if let Some(name) = identity.instance_name {
                self.kv()
                    .put(KEY_INSTANCE_NAME, name.into_bytes())
                    .await
                    .map_err(|e| MeshError::NotAuthorized(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Restores identity from [`kv`] at startup, before any envelope has
    /// arrived (so a restarted actor does not re-run auto-init).
    async fn load_identity(&self) -> Result<(), MeshError> {
        let binding = self
            .kv()
            .get(KEY_BINDING_NAME)
            .await
            .map_err(|e| MeshError::NotAuthorized(e.to_string()))?;
        let Some(binding) = binding else {
            return Ok(());
        };
        let binding_name = String::from_utf8_lossy(&binding).to_string();
        let instance_name = self
            .kv()
            .get(KEY_INSTANCE_NAME)
            .await
            .map_err(|e| MeshError::NotAuthorized(e.to_string()))?
            .map(|b| String::from_utf8_lossy(&b).to_string());

        self.lmz()
            .dispatcher()
            .restore_identity(binding_name, instance_name);
        Ok(())
    }
}

/// An addressable binding without a persistent instance (spec.md GLOSSARY
/// "Worker / Stateless node"). Each invocation is a fresh execution
/// context; `lmz.instance_name()` is always `None`.
pub trait StatelessWorker: MeshObject + Send + Sync + 'static {
    fn lmz(&self) -> &Lmz;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_registry_memoizes_construction() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut registry = ServiceRegistry::new();
        registry.register("counter", || {
            CALLS.fetch_add(1, Ordering::SeqCst);
            42i64
        });

        let a: Arc<i64> = registry.get("counter").unwrap();
        let b: Arc<i64> = registry.get("counter").unwrap();
        assert_eq!(*a, 42);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_service_fails() {
        let registry = ServiceRegistry::new();
        let result: Result<Arc<i64>, MeshError> = registry.get("missing");
        assert!(matches!(result, Err(MeshError::ServiceNotFound(_))));
    }

    #[test]
    fn builder_wires_identity_and_services_into_lmz() {
        let (lmz, services) = MeshActorBuilder::new()
            .with_identity(NodeIdentity::stateless("svc.counter"))
            .register_service("answer", || 42i64)
            .build(
                Arc::new(crate::testing::NullTransport),
                Arc::new(crate::testing::TestAlarmClock::new()),
            );

        assert_eq!(lmz.binding_name().as_deref(), Some("svc.counter"));
        let answer: Arc<i64> = services.get("answer").unwrap();
        assert_eq!(*answer, 42);
    }
}
