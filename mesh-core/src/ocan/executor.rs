//! Chain execution (spec.md §4.2, components C2 "execute chain against a
//! target" and C3 "mesh gate").
//!
//! Grounds on `anda_core::tool::{ToolDyn, ToolSet}` for the
//! "resolve-by-name, invoke, await" dispatch loop, and on
//! `anda_engine::engine::Engine::tool_call`'s "only validate on entry"
//! shape for why the gate below fires on the first `Apply` only.

use crate::chain::{Key, Operation, OperationChain};
use crate::context::CallContext;
use crate::error::MeshError;
use crate::object::{MeshMethod, MeshObject};
use crate::serialize::Value;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;

/// Tunables for [`execute`] (spec.md §4.2.1).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_depth: usize,
    pub max_args: usize,
    /// If `false`, the mesh gate is bypassed entirely — used by internal
    /// loopback dispatch, where the caller is already trusted.
    pub require_mesh_decorator: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::chain::DEFAULT_MAX_DEPTH,
            max_args: crate::chain::DEFAULT_MAX_ARGS,
            require_mesh_decorator: true,
        }
    }
}

enum Step {
    Value(Value),
    /// A method resolved by a `Get` step, awaiting its `Apply`. Carries the
    /// owning object (for the mesh-gate's `bypasses_mesh_gate` check) and
    /// the key it was resolved under (for diagnostics).
    Pending(Arc<dyn MeshMethod>, Arc<dyn MeshObject>, Key),
}

/// Runs `chain` against `root`, resolving nested-operation markers and
/// enforcing the mesh gate on the first `Apply` only (testable property 5,
/// "capability trust": everything reachable after that first gated call is
/// trusted without re-checking).
pub fn execute(
    root: Arc<dyn MeshObject>,
    chain: OperationChain,
    ctx: CallContext,
    config: ExecutorConfig,
) -> BoxFuture<'static, Result<Value, MeshError>> {
    Box::pin(async move {
        if chain.len() > config.max_depth {
            return Err(MeshError::ChainTooDeep {
                depth: chain.len(),
                max: config.max_depth,
            });
        }

        let mut current = Step::Value(Value::Object(root.clone()));
        let mut is_first_apply = true;

        for op in chain.0.into_iter() {
            match op {
                Operation::Get(key) => {
                    current = match current {
                        Step::Value(Value::Object(obj)) => {
                            if let Some(method) = obj.get_method(&key) {
                                Step::Pending(method, obj, key)
                            } else {
                                Step::Value(obj.get_field(&key)?)
                            }
                        }
                        _ => return Err(MeshError::NotCallable(key.to_string())),
                    };
                }
                Operation::Apply(args) => {
                    if args.len() > config.max_args {
                        return Err(MeshError::TooManyArgs {
                            count: args.len(),
                            max: config.max_args,
                        });
                    }
                    current = match current {
                        Step::Pending(method, owner, key) => {
                            if is_first_apply
                                && config.require_mesh_decorator
                                && !owner.bypasses_mesh_gate()
                            {
                                if method.mesh_marker().is_none() {
                                    return Err(MeshError::NotMeshCallable {
                                        target: key.to_string(),
                                    });
                                }
                                if let Some(registry) = owner.mesh_registry() {
                                    registry.check(&key.to_string(), &ctx)?;
                                }
                                method.check_guard(&ctx)?;
                            }
                            let resolved =
                                resolve_nested(args, root.clone(), ctx.clone(), config.clone())
                                    .await?;
                            let result = method.call(resolved).await?;
                            is_first_apply = false;
                            Step::Value(result)
                        }
                        Step::Value(_) => {
                            return Err(MeshError::NotCallable(
                                "value is not callable".to_string(),
                            ));
                        }
                    };
                }
            }
        }

        match current {
            Step::Value(v) => Ok(v),
            Step::Pending(_, _, key) => Err(MeshError::NotCallable(format!(
                "chain ended on an uninvoked method {key}"
            ))),
        }
    })
}

/// Resolves every [`Value::NestedOperationChain`] marker found (directly or
/// nested inside `Array`/`Map`/`Set`/`Shared`) in `args`, replacing each
/// with the result of running it against `root` (spec.md §4.2.3).
fn resolve_nested(
    args: Vec<Value>,
    root: Arc<dyn MeshObject>,
    ctx: CallContext,
    config: ExecutorConfig,
) -> BoxFuture<'static, Result<Vec<Value>, MeshError>> {
    Box::pin(async move {
        let visited = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(resolve_value(arg, root.clone(), ctx.clone(), config.clone(), visited.clone()).await?);
        }
        Ok(out)
    })
}

fn resolve_value(
    value: Value,
    root: Arc<dyn MeshObject>,
    ctx: CallContext,
    config: ExecutorConfig,
    visited: Arc<parking_lot::Mutex<HashSet<usize>>>,
) -> BoxFuture<'static, Result<Value, MeshError>> {
    Box::pin(async move {
        match value {
            Value::NestedOperationChain(chain) => execute(root, chain, ctx, config).await,
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(
                        resolve_value(item, root.clone(), ctx.clone(), config.clone(), visited.clone())
                            .await?,
                    );
                }
                Ok(Value::Array(out))
            }
            Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(
                        resolve_value(item, root.clone(), ctx.clone(), config.clone(), visited.clone())
                            .await?,
                    );
                }
                Ok(Value::Set(out))
            }
            Value::Map(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let k2 = resolve_value(k, root.clone(), ctx.clone(), config.clone(), visited.clone()).await?;
                    let v2 = resolve_value(v, root.clone(), ctx.clone(), config.clone(), visited.clone()).await?;
                    out.push((k2, v2));
                }
                Ok(Value::Map(out))
            }
            Value::Shared(cell) => {
                let ptr = Arc::as_ptr(&cell) as usize;
                {
                    let mut guard = visited.lock();
                    if guard.contains(&ptr) {
                        return Ok(Value::Shared(cell));
                    }
                    guard.insert(ptr);
                }
                let inner = cell.read().clone();
                let resolved = resolve_value(inner, root, ctx, config, visited).await?;
                *cell.write() = resolved;
                Ok(Value::Shared(cell))
            }
            other => Ok(other),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Key;
    use crate::identity::NodeIdentity;
    use crate::object::MeshMarker;
    use std::sync::Mutex;

    struct Adder {
        total: Mutex<i64>,
    }

    struct AddMethod;
    impl MeshMethod for AddMethod {
        fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move {
                let mut sum = 0i64;
                for a in args {
                    if let Value::Int(i) = a {
                        sum += i;
                    }
                }
                Ok(Value::Int(sum))
            })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("add")))
        }
    }

    struct SecretMethod;
    impl MeshMethod for SecretMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move { Ok(Value::Str("shh".to_string())) })
        }
    }

    /// Mesh-callable, but denies every caller — exercises the `GuardDenied`
    /// path of the gate (testable property 4).
    struct AdminOnlyMethod;
    impl MeshMethod for AdminOnlyMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move { Ok(Value::Null) })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("admin_only")))
        }

        fn check_guard(&self, _ctx: &CallContext) -> Result<(), MeshError> {
            Err(MeshError::GuardDenied("not an admin".to_string()))
        }
    }

    /// Reached only once already inside the chain (via `EnterMethod`'s
    /// result) — never itself mesh-marked, so it must still run (testable
    /// property 5, "forceReset executed without a second gate check
    /// regardless of its decorator").
    struct ForceResetMethod;
    impl MeshMethod for ForceResetMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move { Ok(Value::Str("reset".to_string())) })
        }
    }

    struct InnerObject;
    impl MeshObject for InnerObject {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            Err(MeshError::NotCallable(key.to_string()))
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "force_reset" => Some(Arc::new(ForceResetMethod)),
                _ => None,
            }
        }
    }

    /// The gated entry point: returns a live object one hop past the gate,
    /// matching spec.md §4.2 "Get may return a nested object".
    struct EnterMethod;
    impl MeshMethod for EnterMethod {
        fn call(&self, _args: Vec<Value>) -> BoxFuture<'static, Result<Value, MeshError>> {
            Box::pin(async move { Ok(Value::Object(Arc::new(InnerObject))) })
        }

        fn mesh_marker(&self) -> Option<&MeshMarker> {
            static MARKER: std::sync::OnceLock<MeshMarker> = std::sync::OnceLock::new();
            Some(MARKER.get_or_init(|| MeshMarker::new("enter")))
        }
    }

    impl MeshObject for Adder {
        fn get_field(&self, key: &Key) -> Result<Value, MeshError> {
            match key {
                Key::Str(s) if s == "total" => Ok(Value::Int(*self.total.lock().unwrap())),
                _ => Err(MeshError::NotCallable(key.to_string())),
            }
        }

        fn get_method(&self, key: &Key) -> Option<Arc<dyn MeshMethod>> {
            match key {
                Key::Str(s) if s == "add" => Some(Arc::new(AddMethod)),
                Key::Str(s) if s == "secret" => Some(Arc::new(SecretMethod)),
                Key::Str(s) if s == "admin_only" => Some(Arc::new(AdminOnlyMethod)),
                Key::Str(s) if s == "enter" => Some(Arc::new(EnterMethod)),
                _ => None,
            }
        }
    }

    fn ctx() -> CallContext {
        CallContext::new_origin(NodeIdentity::client("c1"))
    }

    #[tokio::test]
    async fn mesh_gated_method_is_callable_on_first_apply() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("add".into()));
        chain.push_apply(vec![Value::Int(2), Value::Int(3)]);

        let result = execute(root, chain, ctx(), ExecutorConfig::default())
            .await
            .unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[tokio::test]
    async fn unmarked_method_is_rejected_on_first_apply() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("secret".into()));
        chain.push_apply(vec![]);

        let err = execute(root, chain, ctx(), ExecutorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::NotMeshCallable { .. }));
    }

    #[tokio::test]
    async fn nested_marker_is_resolved_before_outer_apply() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });

        let mut nested = OperationChain::new();
        nested.push_get(Key::Str("add".into()));
        nested.push_apply(vec![Value::Int(10), Value::Int(20)]);

        let mut outer = OperationChain::new();
        outer.push_get(Key::Str("add".into()));
        outer.push_apply(vec![
            Value::Int(1),
            Value::NestedOperationChain(nested),
        ]);

        let result = execute(root, outer, ctx(), ExecutorConfig::default())
            .await
            .unwrap();
        assert_eq!(result, Value::Int(31));
    }

    #[tokio::test]
    async fn guarded_entry_point_denies_a_failing_context() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("admin_only".into()));
        chain.push_apply(vec![]);

        let err = execute(root, chain, ctx(), ExecutorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::GuardDenied(_)));
    }

    #[tokio::test]
    async fn unmarked_method_later_in_chain_skips_the_gate() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("enter".into()));
        chain.push_apply(vec![]);
        chain.push_get(Key::Str("force_reset".into()));
        chain.push_apply(vec![]);

        let result = execute(root, chain, ctx(), ExecutorConfig::default())
            .await
            .unwrap();
        assert_eq!(result, Value::Str("reset".to_string()));
    }

    #[tokio::test]
    async fn chain_too_deep_is_rejected() {
        let root: Arc<dyn MeshObject> = Arc::new(Adder {
            total: Mutex::new(0),
        });
        let mut chain = OperationChain::new();
        for _ in 0..5 {
            chain.push_get(Key::Str("total".into()));
        }
        let config = ExecutorConfig {
            max_depth: 3,
            ..ExecutorConfig::default()
        };
        let err = execute(root, chain, ctx(), config).await.unwrap_err();
        assert!(matches!(err, MeshError::ChainTooDeep { .. }));
    }
}
