//! Error taxonomy (spec.md §7).
//!
//! Where `anda_core::tool`/`anda_core::agent` format errors ad hoc with
//! `.map_err(|err| format!(...).into())`, the mesh needs a closed,
//! matchable set so a receiver can branch on *kind* (`NotMeshCallable` vs.
//! `GuardDenied` vs. a plain application error) rather than parse a
//! message string. `anda_core` already carries a direct `thiserror`
//! dependency for this purpose; this is its first real use.

use crate::serialize::{ErrorValue, Value};

/// Boxed, thread-safe error — the same alias `anda_core::BoxError` uses,
/// kept as `dyn Error + 'static` explicitly so downcasting works at
/// every hop (see [`MeshError::from_any`]).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed taxonomy from spec.md §7, plus an escape hatch
/// ([`MeshError::App`]) for application-defined error classes thrown from
/// `@mesh`-marked methods (testable property 13).
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("serialization error at {path}: {message}")]
    Serialization { path: String, message: String },

    #[error("unsupported envelope version {0}, expected 1")]
    UnsupportedEnvelope(u32),

    #[error("envelope is missing a call context")]
    MissingContext,

    #[error("identity mismatch: node is already {existing}, envelope asserted {asserted}")]
    IdentityMismatch { existing: String, asserted: String },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("{target} is not reachable as a mesh entry point (missing #[mesh] marker)")]
    NotMeshCallable { target: String },

    #[error("guard denied the call: {0}")]
    GuardDenied(String),

    #[error("{0} is not callable")]
    NotCallable(String),

    #[error("chain depth {depth} exceeds the configured maximum of {max}")]
    ChainTooDeep { depth: usize, max: usize },

    #[error("apply with {count} arguments exceeds the configured maximum of {max}")]
    TooManyArgs { count: usize, max: usize },

    #[error("call timed out after {0}ms")]
    Timeout(u64),

    #[error("client disconnected before the result could be delivered")]
    ClientDisconnected,

    #[error("service {0} is not registered")]
    ServiceNotFound(String),

    /// An application-defined error class (spec.md §4.1 "custom error
    /// classes"). Thrown explicitly by `@mesh` method implementations via
    /// [`MeshError::app`]; round-trips through the wire with its class
    /// name, message and properties intact.
    #[error("{class}: {message}")]
    App {
        class: String,
        message: String,
        properties: Vec<(String, Value)>,
    },
}

impl MeshError {
    pub fn app(
        class: impl Into<String>,
        message: impl Into<String>,
        properties: Vec<(String, Value)>,
    ) -> Self {
        MeshError::App {
            class: class.into(),
            message: message.into(),
            properties,
        }
    }

    /// The wire class name for this error kind (used by the generic
    /// `$error` reconstruction described in spec.md §4.1/§7).
    pub fn class_name(&self) -> String {
        match self {
            MeshError::Serialization { .. } => "SerializationError".to_string(),
            MeshError::UnsupportedEnvelope(_) => "UnsupportedEnvelope".to_string(),
            MeshError::MissingContext => "MissingContext".to_string(),
            MeshError::IdentityMismatch { .. } => "IdentityMismatch".to_string(),
            MeshError::NotAuthorized(_) => "NotAuthorized".to_string(),
            MeshError::NotMeshCallable { .. } => "NotMeshCallable".to_string(),
            MeshError::GuardDenied(_) => "GuardDenied".to_string(),
            MeshError::NotCallable(_) => "NotCallable".to_string(),
            MeshError::ChainTooDeep { .. } => "ChainTooDeep".to_string(),
            MeshError::TooManyArgs { .. } => "TooManyArgs".to_string(),
            MeshError::Timeout(_) => "TimeoutError".to_string(),
            MeshError::ClientDisconnected => "ClientDisconnected".to_string(),
            MeshError::ServiceNotFound(_) => "ServiceNotFound".to_string(),
            MeshError::App { class, .. } => class.clone(),
        }
    }

    fn wire_properties(&self) -> Vec<(String, Value)> {
        match self {
            MeshError::ChainTooDeep { depth, max } => vec![
                ("depth".to_string(), Value::Int(*depth as i64)),
                ("max".to_string(), Value::Int(*max as i64)),
            ],
            MeshError::TooManyArgs { count, max } => vec![
                ("count".to_string(), Value::Int(*count as i64)),
                ("max".to_string(), Value::Int(*max as i64)),
            ],
            MeshError::IdentityMismatch { existing, asserted } => vec![
                ("existing".to_string(), Value::Str(existing.clone())),
                ("asserted".to_string(), Value::Str(asserted.clone())),
            ],
            MeshError::App { properties, .. } => properties.clone(),
            _ => Vec::new(),
        }
    }

    /// Wraps this error for transport across the call boundary (spec.md
    /// §4.4.3 step 6 / §9 "error-wrapping in `$result`").
    pub fn to_error_value(&self) -> ErrorValue {
        ErrorValue {
            class: self.class_name(),
            message: self.to_string(),
            properties: self.wire_properties(),
        }
    }

    /// Reverses [`MeshError::to_error_value`] for the subset of classes
    /// this taxonomy defines; returns `None` for application-defined or
    /// unrecognized classes so the caller can fall back to the
    /// [`crate::serialize::ErrorRegistry`].
    pub fn from_error_value(ev: &ErrorValue) -> Option<MeshError> {
        let get_int = |name: &str| -> Option<i64> {
            ev.properties.iter().find(|(k, _)| k == name).and_then(|(_, v)| match v {
                Value::Int(i) => Some(*i),
                _ => None,
            })
        };
        let get_str = |name: &str| -> Option<String> {
            ev.properties.iter().find(|(k, _)| k == name).and_then(|(_, v)| match v {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            })
        };
        match ev.class.as_str() {
            "SerializationError" => Some(MeshError::Serialization {
                path: "$".to_string(),
                message: ev.message.clone(),
            }),
            "MissingContext" => Some(MeshError::MissingContext),
            "NotAuthorized" => Some(MeshError::NotAuthorized(ev.message.clone())),
            "NotMeshCallable" => Some(MeshError::NotMeshCallable {
                target: ev.message.clone(),
            }),
            "GuardDenied" => Some(MeshError::GuardDenied(ev.message.clone())),
            "NotCallable" => Some(MeshError::NotCallable(ev.message.clone())),
            "ChainTooDeep" => Some(MeshError::ChainTooDeep {
                depth: get_int("depth")? as usize,
                max: get_int("max")? as usize,
            }),
            "TooManyArgs" => Some(MeshError::TooManyArgs {
                count: get_int("count")? as usize,
                max: get_int("max")? as usize,
            }),
            "TimeoutError" => Some(MeshError::Timeout(0)),
            "ClientDisconnected" => Some(MeshError::ClientDisconnected),
            "ServiceNotFound" => Some(MeshError::ServiceNotFound(ev.message.clone())),
            "IdentityMismatch" => Some(MeshError::IdentityMismatch {
                existing: get_str("existing")?,
                asserted: get_str("asserted")?,
            }),
            _ => None,
        }
    }

    /// Converts any boxed error into a wire [`ErrorValue`], preferring a
    /// [`MeshError`] downcast and otherwise emitting a generic error
    /// carrying the original message (spec.md §4.1 "otherwise it
    /// constructs a generic error carrying the original name and message").
    pub fn encode(err: &(dyn std::error::Error + 'static)) -> ErrorValue {
        if let Some(me) = err.downcast_ref::<MeshError>() {
            return me.to_error_value();
        }
        ErrorValue {
            class: "Error".to_string(),
            message: err.to_string(),
            properties: Vec::new(),
        }
    }

    /// Reconstructs a boxed error from the wire, using the taxonomy first
    /// and falling back to the process-wide [`crate::serialize::ErrorRegistry`].
    pub fn decode(ev: ErrorValue) -> BoxError {
        if let Some(me) = MeshError::from_error_value(&ev) {
            return Box::new(me);
        }
        crate::serialize::ErrorRegistry::global().decode(&ev)
    }
}
