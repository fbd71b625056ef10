//! Call-context propagation (spec.md §3 `CallContext`, §4.4).
//!
//! Grounds on `anda_engine::context::base::BaseCtx::child`/`child_with`
//! (depth-limited child contexts that preserve `user`/`caller` across a
//! nested call) and `anda_core::context::StateFeatures::cancellation_token`
//! (an independently cancellable scope per call level). Ambient storage
//! uses `tokio::task_local!`, the idiom spec.md's Design Note §9 calls for
//! explicitly ("a task-local / async-local mechanism honoring
//! await/suspension") — the one piece of this module not lifted verbatim
//! from the teacher, which threads `BaseCtx`/`AgentCtx` explicitly by value
//! instead of making it ambient.

use crate::error::MeshError;
use crate::identity::NodeIdentity;
use std::collections::BTreeMap;

/// Authentication asserted at the origin of a call chain (spec.md §3
/// `CallContext.originAuth`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OriginAuth {
    pub user_id: String,
    #[serde(default)]
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Ambient, per-invocation record threaded through a call chain.
///
/// `state` deliberately holds plain `serde_json::Value`, not
/// `crate::serialize::Value`: spec.md §6 frames the envelope's `chain`
/// field as the only part that goes through the structured-serialize
/// service, everything else — context included — is plain JSON.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallContext {
    pub call_chain: Vec<NodeIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_auth: Option<OriginAuth>,
    #[serde(default)]
    pub state: BTreeMap<String, serde_json::Value>,
}

impl CallContext {
    /// Starts a new call chain with `origin` as its sole, first entry
    /// (invariant 1: the chain is never empty).
    pub fn new_origin(origin: NodeIdentity) -> Self {
        Self {
            call_chain: vec![origin],
            origin_auth: None,
            state: BTreeMap::new(),
        }
    }

    /// The first hop of the chain — who started this call (invariant 3:
    /// origin is never rewritten except at a new-chain boundary).
    pub fn origin(&self) -> &NodeIdentity {
        self.call_chain
            .first()
            .expect("CallContext.call_chain is never empty")
    }

    /// The most recent hop — who is directly invoking the current node.
    pub fn caller(&self) -> &NodeIdentity {
        self.call_chain
            .last()
            .expect("CallContext.call_chain is never empty")
    }

    /// Produces the context seen by the next hop (spec.md §4.4.1–§4.4.3).
    ///
    /// If `new_chain` is true, `next_hop` starts a fresh chain of its own
    /// (e.g. a broadcaster fanning out to subscribers): the new context's
    /// `call_chain` is `[next_hop]` and `origin_auth` is cleared, per
    /// invariant 4 ("originAuth is cleared only at a new-chain boundary").
    /// Otherwise `next_hop` is appended to the existing chain and
    /// `origin_auth` carries forward unchanged.
    pub fn advance(&self, next_hop: NodeIdentity, new_chain: bool) -> Self {
        if new_chain {
            Self {
                call_chain: vec![next_hop],
                origin_auth: None,
                state: self.state.clone(),
            }
        } else {
            let mut call_chain = self.call_chain.clone();
            call_chain.push(next_hop);
            Self {
                call_chain,
                origin_auth: self.origin_auth.clone(),
                state: self.state.clone(),
            }
        }
    }
}

tokio::task_local! {
    static CURRENT: CallContext;
}

/// Runs `f` with `ctx` as the ambient call context for its entire duration,
/// including across `.await` points (the task-local scope honors
/// suspension, unlike a plain thread-local).
pub async fn run_with_call_context<F, Fut, T>(ctx: CallContext, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    CURRENT.scope(ctx, f()).await
}

/// Reads the ambient call context, or `MissingContext` if none is active
/// (the idiomatic `Result`-based equivalent of the source's "throws if no
/// context is active").
pub fn current_call_context() -> Result<CallContext, MeshError> {
    CURRENT
        .try_with(|c| c.clone())
        .map_err(|_| MeshError::MissingContext)
}
