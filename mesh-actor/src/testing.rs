//! In-memory mesh harness (SPEC_FULL.md §3 "testing").
//!
//! Grounds on `anda_engine::context::mock`'s pattern of a minimal
//! in-process stand-in for the host runtime, generalized to this crate's
//! [`Transport`]/[`ActorHandle`]/[`KvStore`]/[`AlarmHost`] seams so the
//! end-to-end scenarios (spec.md §8) can run without a real network, clock
//! or datastore.

use async_trait::async_trait;
use mesh_core::envelope::CallEnvelope;
use mesh_core::identity::NodeIdentity;
use mesh_core::object::MeshObject;
use mesh_core::{BoxError, CallResponse, MeshError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatch::{Dispatcher, ResultOutcome};
use crate::host::{ActorHandle, AlarmCallback, AlarmHandle, AlarmHost, KvStore, Transport};

/// One node registered with a [`TestMesh`]: the live object chains execute
/// against, and the dispatcher that fields its incoming envelopes and
/// delivered results.
struct TestNode {
    identity: NodeIdentity,
    object: Arc<dyn MeshObject>,
    dispatcher: Dispatcher,
}

#[async_trait]
impl ActorHandle for TestNode {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    async fn send(&self, envelope: CallEnvelope) -> Result<CallResponse, MeshError> {
        Ok(self
            .dispatcher
            .execute_operation(envelope, self.object.clone(), |_ctx| Ok(()))
            .await)
    }

    async fn deliver_result(&self, req_id: String, outcome: ResultOutcome) -> Result<(), MeshError> {
        self.dispatcher.handle_result(req_id, outcome).await;
        Ok(())
    }
}

/// An in-process mesh: a registry of addressable nodes keyed by binding
/// name, doubling as the [`Transport`] that resolves calls between them.
/// One `TestMesh` stands in for an entire deployment in a test.
#[derive(Default)]
pub struct TestMesh {
    nodes: Mutex<HashMap<String, Arc<dyn ActorHandle>>>,
}

impl TestMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `object` as reachable under `identity.binding_name`,
    /// binding `dispatcher`'s root so its internally-delivered
    /// continuations (spec.md §4.4.4) run against `object`.
    pub fn register(&self, identity: NodeIdentity, object: Arc<dyn MeshObject>, dispatcher: Dispatcher) {
        dispatcher.bind_root(&object);
        self.register_handle(
            identity.binding_name.clone(),
            Arc::new(TestNode {
                identity,
                object,
                dispatcher,
            }),
        );
    }

    /// Registers an arbitrary [`ActorHandle`] under `binding_name` directly
    /// — used by tests that need to model a node's transport-level
    /// behavior (e.g. one that never replies) rather than a real
    /// [`MeshObject`]/[`Dispatcher`] pair.
    pub fn register_handle(&self, binding_name: impl Into<String>, handle: Arc<dyn ActorHandle>) {
        self.nodes.lock().insert(binding_name.into(), handle);
    }
}

#[async_trait]
impl Transport for TestMesh {
    async fn resolve(&self, identity: &NodeIdentity) -> Result<Arc<dyn ActorHandle>, MeshError> {
        self.nodes
            .lock()
            .get(&identity.binding_name)
            .cloned()
            .ok_or_else(|| MeshError::ServiceNotFound(identity.binding_name.clone()))
    }
}

/// A [`Transport`] that resolves nothing — for unit tests that only care
/// about a [`Dispatcher`]'s local state, never its outgoing calls.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn resolve(&self, identity: &NodeIdentity) -> Result<Arc<dyn ActorHandle>, MeshError> {
        Err(MeshError::ServiceNotFound(identity.binding_name.clone()))
    }
}

/// Unbounded in-memory [`KvStore`], for exercising [`crate::actor::StatefulActor`]
/// identity persistence without a real datastore.
#[derive(Default)]
pub struct InMemoryKvStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BoxError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), BoxError> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

struct TestAlarm {
    settled: Arc<AtomicBool>,
}

#[async_trait]
impl AlarmHandle for TestAlarm {
    async fn cancel(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A [`tokio::time::sleep`]-backed [`AlarmHost`]. `schedule` and `cancel`
/// race on the same atomic flag, so whichever settles first — the timer
/// firing or a caller cancelling — wins exclusively (spec.md §4.4.4
/// testable property 12).
pub struct TestAlarmClock;

impl TestAlarmClock {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TestAlarmClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmHost for TestAlarmClock {
    fn schedule(&self, delay_ms: u64, on_fire: AlarmCallback) -> Arc<dyn AlarmHandle> {
        let settled = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(TestAlarm {
            settled: settled.clone(),
        });
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if settled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                on_fire().await;
            }
        });
        handle
    }
}

/// Brings up structured logging for the integration tests below, the same
/// `dotenv` + `structured_logger::Builder` pairing the teacher's own
/// integration tests use (e.g. `anda_bnb_examples::balance_test`) — `Once`
/// because `Builder::init()` installs the global logger and panics if
/// called twice within one test binary.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        dotenv::dotenv().ok();
        structured_logger::Builder::with_level("debug").init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Lmz, StatelessWorker};
    use crate::dispatch::CallOpts;
    use futures::future::BoxFuture;
    use mesh_core::chain::{Key, OperationChain};
    use mesh_core::context::{run_with_call_context, CallContext};
    use mesh_core::object::{MeshMarker, MeshMethod, MeshObject};
    use mesh_core::{ExecutorConfig, Value};
    use std::sync::Mutex as StdMutex;

    /// Echoes its single argument back, reachable as a mesh entry point
    /// (spec.md §8 scenario E1 "single-hop echo").
    struct EchoMethod;
    impl MeshMethod for EchoMethod {
        fn call(&self, mut args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move { Ok(args.pop().unwrap_or(Value::Null)) })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("echo")))
        }
    }

    /// Records every value it receives — the continuation target for the
    /// fire-and-forget scenarios (E4, E5).
    struct RecorderMethod {
        log: Arc<StdMutex<Vec<Value>>>,
    }
    impl MeshMethod for RecorderMethod {
        fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            let log = self.log.clone();
            Box::pin(async move {
                log.lock().unwrap().extend(args);
                Ok(Value::Null)
            })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("record")))
        }
    }

    struct EchoService {
        log: Arc<StdMutex<Vec<Value>>>,
    }

    impl MeshObject for EchoService {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            Err(MeshError::NotCallable(key.to_string()))
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "echo" => Some(Arc::new(EchoMethod)),
                Key::Str(s) if s == "record" => Some(Arc::new(RecorderMethod {
                    log: self.log.clone(),
                })),
                _ => None,
            }
        }
    }

    fn client_ctx() -> CallContext {
        CallContext::new_origin(NodeIdentity::client("test-client"))
    }

    fn make_node(mesh: &Arc<TestMesh>, binding_name: &str) -> (Arc<EchoService>, Dispatcher, Arc<StdMutex<Vec<Value>>>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let service = Arc::new(EchoService { log: log.clone() });
        let identity = NodeIdentity::stateless(binding_name);
        let dispatcher = Dispatcher::new(
            Some(identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        mesh.register(identity, service.clone() as Arc<dyn MeshObject>, dispatcher.clone());
        (service, dispatcher, log)
    }

    #[tokio::test]
    async fn single_hop_echo_round_trips_through_call_raw() {
        init_test_logging();
        let mesh = Arc::new(TestMesh::new());
        let (_svc, _dispatcher, _log) = make_node(&mesh, "svc.echo");

        let caller = Dispatcher::new(
            Some(NodeIdentity::client("test-client")),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );

        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("echo".into()));
        chain.push_apply(vec![Value::Str("hello".into())]);

        let result = run_with_call_context(client_ctx(), || {
            caller.call_raw(NodeIdentity::stateless("svc.echo"), chain)
        })
        .await
        .unwrap();

        assert_eq!(result, Value::Str("hello".into()));
    }

    #[tokio::test]
    async fn unreachable_binding_surfaces_service_not_found() {
        let mesh = Arc::new(TestMesh::new());
        let caller = Dispatcher::new(
            Some(NodeIdentity::client("test-client")),
            mesh,
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("echo".into()));
        chain.push_apply(vec![]);

        let err = run_with_call_context(client_ctx(), || {
            caller.call_raw(NodeIdentity::stateless("svc.missing"), chain)
        })
        .await
        .unwrap_err();

        assert!(err.downcast_ref::<MeshError>().is_some());
    }

    #[tokio::test]
    async fn fire_and_forget_delivers_result_to_continuation() {
        let mesh = Arc::new(TestMesh::new());
        let (_echo_svc, _echo_dispatcher, _echo_log) = make_node(&mesh, "svc.echo");
        let (recorder_svc, recorder_dispatcher, recorder_log) = make_node(&mesh, "svc.recorder");

        let mut remote = OperationChain::new();
        remote.push_get(Key::Str("echo".into()));
        remote.push_apply(vec![Value::Str("ping".into())]);

        let mut continuation = OperationChain::new();
        continuation.push_get(Key::Str("record".into()));
        continuation.push_apply(vec![Value::ResultPlaceholder]);

        run_with_call_context(client_ctx(), || {
            recorder_dispatcher.call(
                NodeIdentity::stateless("svc.echo"),
                remote,
                Some(continuation),
                CallOpts::default(),
            )
        })
        .await
        .unwrap();

        // The fire-and-forget dispatch and the echo's reply both cross an
        // async boundary (tokio::spawn, then svc.echo answering) before
        // `deliver_result` runs; give them room to land.
        for _ in 0..20 {
            if !recorder_log.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(recorder_log.lock().unwrap().as_slice(), &[Value::Str("ping".into())]);
        let _ = recorder_svc;
    }

    /// Resolves but never replies — models a remote that is reachable yet
    /// wedged, so the only way the caller's continuation ever runs is via
    /// the backstop alarm.
    struct HangingHandle {
        identity: NodeIdentity,
    }

    #[async_trait]
    impl ActorHandle for HangingHandle {
        fn identity(&self) -> &NodeIdentity {
            &self.identity
        }

        async fn send(&self, _envelope: CallEnvelope) -> Result<CallResponse, MeshError> {
            std::future::pending().await
        }

        async fn deliver_result(&self, _req_id: String, _outcome: ResultOutcome) -> Result<(), MeshError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn timeout_backstop_fires_when_no_result_arrives() {
        let mesh = Arc::new(TestMesh::new());
        let (_recorder_svc, recorder_dispatcher, recorder_log) = make_node(&mesh, "svc.recorder");
        mesh.register_handle(
            "svc.unreachable",
            Arc::new(HangingHandle {
                identity: NodeIdentity::stateless("svc.unreachable"),
            }),
        );

        let mut remote = OperationChain::new();
        remote.push_get(Key::Str("echo".into()));
        remote.push_apply(vec![]);

        let mut continuation = OperationChain::new();
        continuation.push_get(Key::Str("record".into()));
        continuation.push_apply(vec![Value::ResultPlaceholder]);

        run_with_call_context(client_ctx(), || {
            recorder_dispatcher.call(
                NodeIdentity::stateless("svc.unreachable"),
                remote,
                Some(continuation),
                CallOpts {
                    timeout_ms: Some(20),
                    new_chain: false,
                },
            )
        })
        .await
        .unwrap();

        for _ in 0..30 {
            if !recorder_log.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        match recorder_log.lock().unwrap().first() {
            Some(Value::Error(ev)) => assert_eq!(ev.class, "TimeoutError"),
            other => panic!("expected a TimeoutError value, got {other:?}"),
        }
    }

    struct EchoWorker {
        lmz: Lmz,
    }

    impl MeshObject for EchoWorker {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            Err(MeshError::NotCallable(key.to_string()))
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "echo" => Some(Arc::new(EchoMethod)),
                _ => None,
            }
        }
    }

    impl StatelessWorker for EchoWorker {
        fn lmz(&self) -> &Lmz {
            &self.lmz
        }
    }

    #[tokio::test]
    async fn stateless_worker_has_no_instance_name() {
        let dispatcher = Dispatcher::new(
            Some(NodeIdentity::stateless("svc.echo")),
            Arc::new(NullTransport),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        let worker = EchoWorker {
            lmz: Lmz::new(dispatcher),
        };
        assert_eq!(worker.lmz().instance_name(), None);
        assert_eq!(worker.lmz().binding_name().as_deref(), Some("svc.echo"));
    }

    /// Captures the ambient call context it is invoked under, for
    /// assertions that look "over the shoulder" of a mesh-gated method
    /// (spec.md §8 scenarios E2, E6).
    struct ContextCaptureMethod {
        captured: Arc<StdMutex<Option<CallContext>>>,
    }
    impl MeshMethod for ContextCaptureMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            let captured = self.captured.clone();
            Box::pin(async move {
                let ctx = mesh_core::context::current_call_context()?;
                *captured.lock().unwrap() = Some(ctx);
                Ok(Value::Null)
            })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("get_call_context")))
        }
    }

    struct ContextCaptureService {
        captured: Arc<StdMutex<Option<CallContext>>>,
    }
    impl MeshObject for ContextCaptureService {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            Err(MeshError::NotCallable(key.to_string()))
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "get_call_context" => Some(Arc::new(ContextCaptureMethod {
                    captured: self.captured.clone(),
                })),
                _ => None,
            }
        }
    }

    /// Forwards to another node's `get_call_context`, from inside its own
    /// mesh-gated handler — the middle hop of spec.md §8 scenario E2.
    struct ForwardMethod {
        dispatcher: Dispatcher,
        target: NodeIdentity,
    }
    impl MeshMethod for ForwardMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            let dispatcher = self.dispatcher.clone();
            let target = self.target.clone();
            Box::pin(async move {
                let mut chain = OperationChain::new();
                chain.push_get(Key::Str("get_call_context".into()));
                chain.push_apply(vec![]);
                dispatcher
                    .call_raw(target, chain)
                    .await
                    .map_err(|err| MeshError::NotAuthorized(err.to_string()))
            })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("call_and_return_context")))
        }
    }

    struct ForwardingService {
        dispatcher: Dispatcher,
        target: NodeIdentity,
    }
    impl MeshObject for ForwardingService {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            Err(MeshError::NotCallable(key.to_string()))
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "call_and_return_context" => Some(Arc::new(ForwardMethod {
                    dispatcher: self.dispatcher.clone(),
                    target: self.target.clone(),
                })),
                _ => None,
            }
        }
    }

    /// E2 — three-hop chain: origin `A/1` calls `B/2.callAndReturnContext()`,
    /// which calls `C/3.getCallContext()`. Expect `C` observes
    /// `callChain = [{A,1},{B,2}]` (testable property 8).
    #[tokio::test]
    async fn three_hop_chain_propagates_call_chain() {
        init_test_logging();
        let mesh = Arc::new(TestMesh::new());

        let captured = Arc::new(StdMutex::new(None));
        let c_identity = NodeIdentity::stateful("C", "3");
        let c_dispatcher = Dispatcher::new(
            Some(c_identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        let c_service: Arc<dyn MeshObject> = Arc::new(ContextCaptureService {
            captured: captured.clone(),
        });
        mesh.register(c_identity.clone(), c_service, c_dispatcher);

        let b_identity = NodeIdentity::stateful("B", "2");
        let b_dispatcher = Dispatcher::new(
            Some(b_identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        let b_service: Arc<dyn MeshObject> = Arc::new(ForwardingService {
            dispatcher: b_dispatcher.clone(),
            target: c_identity.clone(),
        });
        mesh.register(b_identity.clone(), b_service, b_dispatcher);

        let a_identity = NodeIdentity::stateful("A", "1");
        let a_dispatcher = Dispatcher::new(
            Some(a_identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );

        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("call_and_return_context".into()));
        chain.push_apply(vec![]);

        // A issues this call with no ambient context of its own (there is no
        // enclosing incoming envelope) — `outgoing_context` therefore starts
        // a fresh one-element chain with A as origin (spec.md §4.4.1
        // "top-level internal call").
        a_dispatcher.call_raw(b_identity.clone(), chain).await.unwrap();

        let observed = captured.lock().unwrap().clone().expect("C should have run");
        assert_eq!(observed.call_chain, vec![a_identity, b_identity]);
        assert_eq!(observed.call_chain.len(), 2);
    }

    /// E6 — `newChain` fan-out: a broadcaster executing under a client's
    /// chain calls a subscriber with `new_chain: true`. The subscriber must
    /// observe a fresh chain starting at the broadcaster, with `originAuth`
    /// cleared (testable property 9).
    #[tokio::test]
    async fn new_chain_call_resets_chain_and_clears_origin_auth() {
        init_test_logging();
        let mesh = Arc::new(TestMesh::new());

        let captured = Arc::new(StdMutex::new(None));
        let subscriber_identity = NodeIdentity::stateless("svc.subscriber");
        let subscriber_dispatcher = Dispatcher::new(
            Some(subscriber_identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        let subscriber_service: Arc<dyn MeshObject> = Arc::new(ContextCaptureService {
            captured: captured.clone(),
        });
        mesh.register(subscriber_identity.clone(), subscriber_service, subscriber_dispatcher);

        let room_identity = NodeIdentity::stateful("Room", "doc");
        let room_dispatcher = Dispatcher::new(
            Some(room_identity.clone()),
            mesh.clone(),
            Arc::new(TestAlarmClock::new()),
            ExecutorConfig::default(),
        );

        let mut ambient = CallContext::new_origin(NodeIdentity::client("c1"))
            .advance(room_identity.clone(), false);
        ambient.origin_auth = Some(mesh_core::OriginAuth {
            user_id: "u1".to_string(),
            claims: Default::default(),
        });

        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("get_call_context".into()));
        chain.push_apply(vec![]);

        run_with_call_context(ambient, || {
            room_dispatcher.call(subscriber_identity, chain, None, CallOpts {
                timeout_ms: None,
                new_chain: true,
            })
        })
        .await
        .unwrap();

        let mut observed = None;
        for _ in 0..20 {
            if let Some(ctx) = captured.lock().unwrap().clone() {
                observed = Some(ctx);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let observed = observed.expect("subscriber should have run");
        assert_eq!(observed.call_chain, vec![room_identity]);
        assert_eq!(observed.origin_auth, None);
    }
}
