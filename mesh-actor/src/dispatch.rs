//! Mesh dispatcher (spec.md §4.4, component C4).
//!
//! Grounds on `anda_engine::engine::Engine::{agent_run, tool_call}` for the
//! "validate → build child ctx → run hooks → invoke → unwrap result" shape,
//! and on `anda_engine::engine::{Hook, Hooks}` as the `on_before_call` hook
//! mechanism. Logs the way `anda_engine`/`anda_engine_server` do: structured
//! key-value `log`/`structured_logger` calls (`log::debug!(req_id = ...;
//! "...")`), not ad hoc `println!`.

use mesh_core::chain::OperationChain;
use mesh_core::identity::{NodeIdentity, NodeKind};
use mesh_core::object::MeshObject;
use mesh_core::serialize::{
    postprocess, postprocess_chain, postprocess_error_value, preprocess, preprocess_chain,
    preprocess_error_value,
};
use mesh_core::{
    BoxError, CallContext, CallEnvelope, CallResponse, ErrorValue, ExecutorConfig, MeshError, Value,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use structured_logger::unix_ms;

use crate::host::{AlarmHandle, AlarmHost, Transport};

/// A fire-and-forget call's eventual outcome, delivered back to the caller
/// (spec.md §4.4.4). Errors travel "as values", never as a Rust `Err` —
/// the continuation handler branches on the value the same way application
/// code would (spec.md §7 "asynchronous `call` ... delivers errors as
/// values").
#[derive(Debug, Clone)]
pub enum ResultOutcome {
    Success(Value),
    Failure(ErrorValue),
}

impl ResultOutcome {
    fn into_value(self) -> Value {
        match self {
            ResultOutcome::Success(v) => v,
            ResultOutcome::Failure(ev) => Value::Error(ev),
        }
    }
}

/// Options for an outgoing fire-and-forget [`Dispatcher::call`] (spec.md
/// §4.4.2).
#[derive(Debug, Clone, Default)]
pub struct CallOpts {
    /// Arms a backstop alarm after this many milliseconds if a
    /// continuation was provided. `None`/`0` means no alarm.
    pub timeout_ms: Option<u64>,
    /// Rewrites the outgoing context so the sender becomes origin and
    /// `originAuth` is dropped (spec.md §4.4.2, invariant 9 "newChain
    /// isolation").
    pub new_chain: bool,
}

/// Caller-side bookkeeping for an outstanding fire-and-forget call (spec.md
/// §3 `PendingContinuation`). Held until either the real result arrives or
/// the backstop alarm fires — the two are made mutually exclusive by
/// [`crate::host::AlarmHandle::cancel`]'s atomic race (spec.md §4.4.4).
struct PendingContinuation {
    continuation: OperationChain,
    captured_context: CallContext,
    alarm: Option<Arc<dyn AlarmHandle>>,
    #[allow(dead_code)]
    created_at: u64,
    #[allow(dead_code)]
    timeout_ms: Option<u64>,
}

struct DispatcherInner {
    identity: parking_lot::RwLock<Option<NodeIdentity>>,
    transport: Arc<dyn Transport>,
    alarms: Arc<dyn AlarmHost>,
    pending: tokio::sync::Mutex<HashMap<String, PendingContinuation>>,
    executor_config: ExecutorConfig,
    /// Weak so the actor (which owns the dispatcher through `Lmz`) and the
    /// dispatcher never form a reference cycle; bound once via
    /// [`Dispatcher::bind_root`] right after the actor's own `Arc` exists.
    /// Needed only by [`Dispatcher::handle_result`]/the timeout path, which
    /// run with no caller-supplied root (spec.md §4.4.4 "internal method").
    root: OnceLock<Weak<dyn MeshObject>>,
}

/// Per-node-instance dispatch surface: outgoing `call_raw`/`call`, incoming
/// `execute_operation`, and internal `handle_result` (spec.md §4.4). Shared
/// (`Clone`, cheap `Arc`) so [`crate::actor::Lmz`] and the actor's own
/// handler code can both hold a reference.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// A stateless worker's identity is fixed for the lifetime of the
    /// dispatcher; a stateful actor starts with `identity = None` until
    /// auto-init or an explicit `init_identity` runs.
    pub fn new(
        identity: Option<NodeIdentity>,
        transport: Arc<dyn Transport>,
        alarms: Arc<dyn AlarmHost>,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                identity: parking_lot::RwLock::new(identity),
                transport,
                alarms,
                pending: tokio::sync::Mutex::new(HashMap::new()),
                executor_config,
                root: OnceLock::new(),
            }),
        }
    }

    /// Binds the actor's own object as the target for internally-delivered
    /// continuations (spec.md §4.4.4). Call once, right after constructing
    /// the actor's `Arc<dyn MeshObject>`. A second call is a no-op.
    pub fn bind_root(&self, root: &Arc<dyn MeshObject>) {
        let _ = self.inner.root.set(Arc::downgrade(root));
    }

    fn root(&self) -> Option<Arc<dyn MeshObject>> {
        self.inner.root.get().and_then(|w| w.upgrade())
    }

    pub fn self_identity(&self) -> Option<NodeIdentity> {
        self.inner.identity.read().clone()
    }

    /// Sets the identity from persisted storage at startup, bypassing the
    /// mismatch check (there is nothing yet to conflict with).
    pub fn restore_identity(&self, binding_name: String, instance_name: Option<String>) {
        *self.inner.identity.write() = Some(NodeIdentity {
            kind: NodeKind::Stateful,
            binding_name,
            instance_name,
        });
    }

    /// Single-assignment identity check used both by explicit
    /// `init_identity` and by auto-init on the first incoming envelope
    /// (spec.md §4.4.5, §9 Open Question 1).
    pub fn assert_identity(
        &self,
        binding_name: &str,
        instance_name: Option<&str>,
    ) -> Result<(), MeshError> {
        let mut slot = self.inner.identity.write();
        match slot.as_ref() {
            Some(existing) => {
                if existing.binding_name == binding_name
                    && existing.instance_name.as_deref() == instance_name
                {
                    Ok(())
                } else {
                    Err(MeshError::IdentityMismatch {
                        existing: existing.to_string(),
                        asserted: format!(
                            "Stateful:{binding_name}{}",
                            instance_name.map(|n| format!("/{n}")).unwrap_or_default()
                        ),
                    })
                }
            }
            None => {
                *slot = Some(NodeIdentity {
                    kind: NodeKind::Stateful,
                    binding_name: binding_name.to_string(),
                    instance_name: instance_name.map(|s| s.to_string()),
                });
                log::debug!(binding_name = binding_name; "auto-initialized stateful identity");
                Ok(())
            }
        }
    }

    fn caller_identity(&self) -> NodeIdentity {
        self.self_identity()
            .unwrap_or_else(|| NodeIdentity::stateless("<gateway>"))
    }

    /// Builds the outgoing call context: appends this node to the ambient
    /// chain, or starts a fresh one-element chain with this node as origin
    /// if there is no ambient context (spec.md §4.4.1 "top-level internal
    /// call"). `new_chain` implements invariant 9.
    fn outgoing_context(&self, new_chain: bool) -> CallContext {
        let me = self.caller_identity();
        match mesh_core::context::current_call_context() {
            Ok(ambient) => ambient.advance(me, new_chain),
            Err(_) => CallContext::new_origin(me),
        }
    }

    fn build_envelope(
        &self,
        target: NodeIdentity,
        chain: &OperationChain,
        new_chain: bool,
    ) -> Result<CallEnvelope, MeshError> {
        let wire_chain = preprocess_chain(chain)?;
        let call_context = self.outgoing_context(new_chain);
        Ok(CallEnvelope::new(
            wire_chain,
            call_context,
            target,
            self.caller_identity(),
        ))
    }

    /// Outgoing synchronous call (spec.md §4.4.1): builds an envelope,
    /// resolves `target` through the host [`Transport`], sends it, and
    /// unwraps the `{$result}`/`{$error}` reply — re-throwing a decoded
    /// error on the `$error` branch so custom error classes survive the
    /// hop (testable property 13).
    pub async fn call_raw(
        &self,
        target: NodeIdentity,
        chain: OperationChain,
    ) -> Result<Value, BoxError> {
        let envelope = self.build_envelope(target.clone(), &chain, false)?;
        log::debug!(
            target_binding = target.binding_name.as_str();
            "call_raw dispatching"
        );
        let handle = self.inner.transport.resolve(&target).await?;
        match handle.send(envelope).await? {
            CallResponse::Result(wire) => Ok(postprocess(&wire)?),
            CallResponse::Error(we) => {
                let ev = postprocess_error_value(&we)?;
                log::warn!(
                    target_binding = target.binding_name.as_str(), error_class = ev.class.as_str();
                    "call_raw received an error response"
                );
                Err(MeshError::decode(ev))
            }
        }
    }

    /// Outgoing fire-and-forget call with an optional result continuation
    /// (spec.md §4.4.2). Returns the generated `reqId` when a continuation
    /// was provided (so a test harness can correlate delivery), `None` for
    /// a purely one-way call.
    pub async fn call(
        &self,
        target: NodeIdentity,
        remote_chain: OperationChain,
        continuation: Option<OperationChain>,
        opts: CallOpts,
    ) -> Result<Option<String>, BoxError> {
        let envelope = self.build_envelope(target.clone(), &remote_chain, opts.new_chain)?;

        let req_id = match continuation {
            Some(continuation) => {
                let req_id = generate_req_id();
                let captured_context = envelope.call_context.clone();

                let alarm = if let Some(timeout_ms) = opts.timeout_ms.filter(|ms| *ms > 0) {
                    let dispatcher = self.clone();
                    let alarm_req_id = req_id.clone();
                    Some(self.inner.alarms.schedule(
                        timeout_ms,
                        Box::new(move || {
                            Box::pin(async move {
                                dispatcher.fire_timeout(alarm_req_id).await;
                            })
                        }),
                    ))
                } else {
                    None
                };

                self.inner.pending.lock().await.insert(
                    req_id.clone(),
                    PendingContinuation {
                        continuation,
                        captured_context,
                        alarm,
                        created_at: unix_ms(),
                        timeout_ms: opts.timeout_ms,
                    },
                );
                Some(req_id)
            }
            None => None,
        };

        log::debug!(
            target_binding = target.binding_name.as_str(), req_id = req_id.clone().unwrap_or_default().as_str();
            "call dispatched (fire-and-forget)"
        );

        let handle = self.inner.transport.resolve(&target).await?;
        // Fire-and-forget: the caller does not await `send`'s reply inline.
        // Its outcome still has to reach this node's own pending table
        // though, so the spawned task itself plays the role of "the
        // receiver delivering the result" (spec.md §4.4.4) by routing
        // straight into `handle_result` once `send` settles.
        let dispatcher = self.clone();
        let spawned_req_id = req_id.clone();
        tokio::spawn(async move {
            match handle.send(envelope).await {
                Ok(response) => {
                    if let Some(req_id) = spawned_req_id {
                        let outcome = match response {
                            CallResponse::Result(wire) => match postprocess(&wire) {
                                Ok(value) => ResultOutcome::Success(value),
                                Err(err) => ResultOutcome::Failure(err.to_error_value()),
                            },
                            CallResponse::Error(we) => match postprocess_error_value(&we) {
                                Ok(ev) => ResultOutcome::Failure(ev),
                                Err(err) => ResultOutcome::Failure(err.to_error_value()),
                            },
                        };
                        dispatcher.handle_result(req_id, outcome).await;
                    }
                }
                Err(err) => {
                    log::warn!(error = err.to_string().as_str(); "fire-and-forget dispatch failed");
                    if let Some(req_id) = spawned_req_id {
                        dispatcher
                            .handle_result(req_id, ResultOutcome::Failure(err.to_error_value()))
                            .await;
                    }
                }
            }
        });

        Ok(req_id)
    }

    async fn fire_timeout(&self, req_id: String) {
        self.resolve_pending_and_run(
            req_id,
            ResultOutcome::Failure(ErrorValue {
                class: "TimeoutError".to_string(),
                message: "call timed out before a result was delivered".to_string(),
                properties: Vec::new(),
            }),
            true,
        )
        .await;
    }

    /// Incoming `__handleResult` (spec.md §4.4.4): the atomic
    /// cancel-vs-fire race against the backstop alarm, then — if this call
    /// won — substitutes `outcome` into the captured continuation and runs
    /// it under the captured context with the mesh gate disabled.
    pub async fn handle_result(&self, req_id: String, outcome: ResultOutcome) {
        self.resolve_pending_and_run(req_id, outcome, false).await;
    }

    /// Shared by both the success path ([`handle_result`]) and the timeout
    /// path ([`fire_timeout`]): whichever gets here first — real result or
    /// alarm fire — wins the race, the other is a no-op (testable property
    /// 12, "timeout/success exclusivity").
    async fn resolve_pending_and_run(&self, req_id: String, outcome: ResultOutcome, is_timeout_path: bool) {
        let mut pending_guard = self.inner.pending.lock().await;
        let Some(pending) = pending_guard.remove(&req_id) else {
            log::debug!(req_id = req_id.as_str(); "no pending continuation for result delivery (already resolved or unknown)");
            return;
        };
        drop(pending_guard);

        if !is_timeout_path {
            if let Some(alarm) = &pending.alarm {
                if !alarm.cancel().await {
                    // Alarm already fired and is running the timeout path;
                    // this late result is discarded (spec.md §4.4.4,
                    // §5 "Cancellation / timeout").
                    log::debug!(req_id = req_id.as_str(); "discarding late result, timeout already fired");
                    return;
                }
            }
        }

        let Some(root) = self.root() else {
            log::warn!(req_id = req_id.as_str(); "no target object bound to run the continuation against");
            return;
        };

        let filled = mesh_core::chain::substitute_result(&pending.continuation, outcome.into_value());
        let config = ExecutorConfig {
            require_mesh_decorator: false,
            ..self.inner.executor_config.clone()
        };
        let exec_ctx = pending.captured_context.clone();
        if let Err(err) =
            mesh_core::context::run_with_call_context(pending.captured_context, move || {
                mesh_core::execute(root, filled, exec_ctx, config)
            })
            .await
        {
            log::warn!(req_id = req_id.as_str(), error = err.to_string().as_str(); "continuation execution failed");
        }
    }

    /// Incoming `__executeOperation` (spec.md §4.4.3): validates the
    /// envelope, auto-initializes identity if this is a fresh stateful
    /// actor, deserializes the chain, and executes it under the envelope's
    /// call context — wrapping success/failure into the `{$result}`/
    /// `{$error}` response (spec.md §4.4.3 step 6).
    pub async fn execute_operation(
        &self,
        envelope: CallEnvelope,
        root: Arc<dyn MeshObject>,
        on_before_call: impl FnOnce(&CallContext) -> Result<(), MeshError> + Send + 'static,
    ) -> CallResponse {
        match self.execute_operation_inner(envelope, root, on_before_call).await {
            Ok(value) => match preprocess(&value) {
                Ok(wire) => CallResponse::Result(wire),
                Err(err) => CallResponse::Error(wire_error_or_fallback(&err)),
            },
            Err(err) => CallResponse::Error(wire_error_or_fallback(&err)),
        }
    }

    async fn execute_operation_inner(
        &self,
        envelope: CallEnvelope,
        root: Arc<dyn MeshObject>,
        on_before_call: impl FnOnce(&CallContext) -> Result<(), MeshError> + Send + 'static,
    ) -> Result<Value, MeshError> {
        envelope.check_version()?;

        if envelope.call_context.call_chain.is_empty() {
            return Err(MeshError::MissingContext);
        }

        if envelope.metadata.callee.kind == NodeKind::Stateful {
            self.assert_identity(
                &envelope.metadata.callee.binding_name,
                envelope.metadata.callee.instance_name.as_deref(),
            )?;
        }

        let chain = postprocess_chain(&envelope.chain)?;
        let ctx = envelope.call_context.clone();
        let config = self.inner.executor_config.clone();

        mesh_core::context::run_with_call_context(ctx.clone(), move || async move {
            on_before_call(&ctx)?;
            mesh_core::execute(root, chain, ctx, config).await
        })
        .await
    }
}

/// Encodes a [`MeshError`] for the wire, falling back to a bare
/// class+message `WireError` if even the error's own properties somehow
/// fail to serialize (spec.md §4.4.3 step 6, "wrap failures as `$error`").
fn wire_error_or_fallback(err: &MeshError) -> mesh_core::WireError {
    let ev = err.to_error_value();
    preprocess_error_value(&ev).unwrap_or(mesh_core::WireError {
        class: ev.class,
        message: ev.message,
        properties: Vec::new(),
    })
}

fn generate_req_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_opts_default_has_no_timeout_or_new_chain() {
        let opts = CallOpts::default();
        assert_eq!(opts.timeout_ms, None);
        assert!(!opts.new_chain);
    }

    #[test]
    fn generated_req_ids_are_unique() {
        let a = generate_req_id();
        let b = generate_req_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn assert_identity_is_single_assignment() {
        let dispatcher = Dispatcher::new(
            None,
            Arc::new(crate::testing::NullTransport),
            Arc::new(crate::testing::TestAlarmClock::new()),
            ExecutorConfig::default(),
        );
        dispatcher.assert_identity("Room", Some("1")).unwrap();
        assert!(dispatcher.assert_identity("Room", Some("1")).is_ok());
        assert!(matches!(
            dispatcher.assert_identity("Room", Some("2")),
            Err(MeshError::IdentityMismatch { .. })
        ));
        let identity = dispatcher.self_identity().unwrap();
        assert_eq!(identity.instance_name.as_deref(), Some("1"));
    }
}
