//! Structured serialization service (spec.md §4.1, component C1).
//!
//! Grounds on `anda_core::json::fix_json_schema`'s style of walking a
//! `serde_json::Value` tree recursively to rewrite it, generalized here to
//! a richer in-memory [`Value`] (with cycles, aliases, typed buffers, Map/
//! Set/Date and custom error classes) and its flattened wire form [`Wire`].
//! The CBOR/JSON split the teacher draws between wire bytes and inspectable
//! payloads (`ciborium` for transport, `serde_json::Value` for everything
//! else, see `context/base.rs`) is mirrored here as `Wire` (transport) vs.
//! `Value` (in-memory, application-facing).

use crate::chain::{Key, Operation, OperationChain};
use crate::error::{BoxError, MeshError};
use crate::object::MeshObject;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// The in-memory value graph operated on by [`crate::ocan`] and the
/// dispatcher. Supports true cycles/aliases via [`Value::Shared`] and live
/// mid-chain objects via [`Value::Object`] — both execution-local, never
/// serialized directly (see [`preprocess`]).
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// An arbitrary-precision integer, carried as its decimal digits (with
    /// an optional leading `-`) rather than `i64`/`f64` so a value wider
    /// than either never silently truncates (spec.md §4.1 "opaque big
    /// integers").
    BigInt(String),
    /// A regular expression's source pattern and flags, kept apart rather
    /// than folded into one string so a receiving regex engine can
    /// reconstruct it however it represents flags natively.
    Regex { pattern: String, flags: String },
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Date(DateTime<Utc>),
    Error(ErrorValue),
    /// A structured HTTP-request analogue with its body already read into
    /// memory (spec.md §4.1 "synchronous body reification" — no streaming
    /// body on the wire).
    Request {
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    /// A nested-operation-chain marker (spec.md §4.2.3): an `Apply`
    /// argument that is itself a chain to run against the same target
    /// before the outer call.
    NestedOperationChain(OperationChain),
    /// The reserved `$result` sentinel (spec.md §4.2.4).
    ResultPlaceholder,
    /// A shared, possibly cyclic, node — compared and cloned by pointer
    /// identity (testable property 2, "argument identity preservation").
    /// `Arc<RwLock<_>>` rather than `Rc<RefCell<_>>` so a `Value` carrying
    /// shared structure remains `Send` across the `.await` points in
    /// `crate::ocan::executor`.
    Shared(Arc<RwLock<Value>>),
    /// A live object returned mid-chain; never reaches the wire.
    Object(Arc<dyn MeshObject>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Regex { pattern: p1, flags: f1 }, Value::Regex { pattern: p2, flags: f2 }) => {
                p1 == p2 && f1 == f2
            }
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (
                Value::Request { method: m1, url: u1, headers: h1, body: b1 },
                Value::Request { method: m2, url: u2, headers: h2, body: b2 },
            ) => m1 == m2 && u1 == u2 && h1 == h2 && b1 == b2,
            (
                Value::Response { status: s1, headers: h1, body: b1 },
                Value::Response { status: s2, headers: h2, body: b2 },
            ) => s1 == s2 && h1 == h2 && b1 == b2,
            (Value::NestedOperationChain(_), Value::NestedOperationChain(_)) => false,
            (Value::ResultPlaceholder, Value::ResultPlaceholder) => true,
            (Value::Shared(a), Value::Shared(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// `{ class, message, properties }` — the wire shape of a thrown error
/// (spec.md §4.1 "custom error classes").
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub class: String,
    pub message: String,
    pub properties: Vec<(String, Value)>,
}

/// The flattened, fully `serde`-derivable transport encoding of [`Value`].
/// `Def`/`Ref` implement alias/cycle support: the first occurrence of a
/// shared node is wrapped in `Def(id, _)`, every later occurrence becomes
/// `Ref(id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Wire {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(serde_bytes::ByteBuf),
    BigInt(String),
    Regex { pattern: String, flags: String },
    Array(Vec<Wire>),
    Map(Vec<(Wire, Wire)>),
    Set(Vec<Wire>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Error(WireError),
    Request {
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        body: Option<serde_bytes::ByteBuf>,
    },
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<serde_bytes::ByteBuf>,
    },
    NestedOperationChain(WireChain),
    ResultPlaceholder,
    Def(u32, Box<Wire>),
    Ref(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub class: String,
    pub message: String,
    pub properties: Vec<(String, Wire)>,
}

/// Wire form of a single [`Operation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireOperation {
    Get(Key),
    Apply(Vec<Wire>),
}

pub type WireChain = Vec<WireOperation>;

/// Converts an in-memory [`Value`] into its wire form, detecting shared
/// `Arc` pointers and replacing repeats with `Wire::Ref`.
pub fn preprocess(value: &Value) -> Result<Wire, MeshError> {
    let mut seen: HashMap<usize, u32> = HashMap::new();
    let mut next_id = 0u32;
    preprocess_inner(value, &mut seen, &mut next_id)
}

fn preprocess_inner(
    value: &Value,
    seen: &mut HashMap<usize, u32>,
    next_id: &mut u32,
) -> Result<Wire, MeshError> {
    Ok(match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::Int(*i),
        Value::Float(f) => Wire::Float(*f),
        Value::Str(s) => Wire::Str(s.clone()),
        Value::Bytes(b) => Wire::Bytes(serde_bytes::ByteBuf::from(b.clone())),
        Value::BigInt(digits) => Wire::BigInt(digits.clone()),
        Value::Regex { pattern, flags } => Wire::Regex {
            pattern: pattern.clone(),
            flags: flags.clone(),
        },
        Value::Request { method, url, headers, body } => Wire::Request {
            method: method.clone(),
            url: url.clone(),
            headers: headers.clone(),
            body: body.clone().map(serde_bytes::ByteBuf::from),
        },
        Value::Response { status, headers, body } => Wire::Response {
            status: *status,
            headers: headers.clone(),
            body: body.clone().map(serde_bytes::ByteBuf::from),
        },
        Value::Array(items) => Wire::Array(
            items
                .iter()
                .map(|v| preprocess_inner(v, seen, next_id))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => Wire::Map(
            entries
                .iter()
                .map(|(k, v)| {
                    Ok((
                        preprocess_inner(k, seen, next_id)?,
                        preprocess_inner(v, seen, next_id)?,
                    ))
                })
                .collect::<Result<_, MeshError>>()?,
        ),
        Value::Set(items) => Wire::Set(
            items
                .iter()
                .map(|v| preprocess_inner(v, seen, next_id))
                .collect::<Result<_, _>>()?,
        ),
        Value::Date(d) => Wire::Date(d.timestamp_millis()),
        Value::Error(ev) => Wire::Error(preprocess_error(ev, seen, next_id)?),
        Value::NestedOperationChain(chain) => {
            Wire::NestedOperationChain(preprocess_chain(chain)?)
        }
        Value::ResultPlaceholder => Wire::ResultPlaceholder,
        Value::Shared(cell) => {
            let ptr = Arc::as_ptr(cell) as usize;
            if let Some(id) = seen.get(&ptr) {
                Wire::Ref(*id)
            } else {
                let id = *next_id;
                *next_id += 1;
                seen.insert(ptr, id);
                let inner = preprocess_inner(&cell.read(), seen, next_id)?;
                Wire::Def(id, Box::new(inner))
            }
        }
        Value::Object(_) => {
            return Err(MeshError::Serialization {
                path: "$".to_string(),
                message: "live mesh objects cannot cross the wire".to_string(),
            });
        }
    })
}

/// Converts a single [`ErrorValue`] to its wire form, independent of any
/// enclosing chain/value — used by the dispatcher to encode the `$error`
/// half of a call response (spec.md §6).
pub fn preprocess_error_value(ev: &ErrorValue) -> Result<WireError, MeshError> {
    let mut seen: HashMap<usize, u32> = HashMap::new();
    let mut next_id = 0u32;
    preprocess_error(ev, &mut seen, &mut next_id)
}

/// Converts a wire [`WireError`] back into an [`ErrorValue`] — the
/// dispatcher-facing counterpart of [`preprocess_error_value`].
pub fn postprocess_error_value(we: &WireError) -> Result<ErrorValue, MeshError> {
    let mut registry: HashMap<u32, Arc<RwLock<Value>>> = HashMap::new();
    postprocess_error(we, &mut registry)
}

fn preprocess_error(
    ev: &ErrorValue,
    seen: &mut HashMap<usize, u32>,
    next_id: &mut u32,
) -> Result<WireError, MeshError> {
    Ok(WireError {
        class: ev.class.clone(),
        message: ev.message.clone(),
        properties: ev
            .properties
            .iter()
            .map(|(k, v)| Ok((k.clone(), preprocess_inner(v, seen, next_id)?)))
            .collect::<Result<_, MeshError>>()?,
    })
}

/// Converts a wire value back into an in-memory [`Value`], reconstructing
/// shared/cyclic nodes from `Def`/`Ref` pairs.
///
/// The registry entry for a `Def` is created *before* its inner content is
/// visited, so a true self-reference (an inner `Ref` pointing back at its
/// own `Def`) resolves to the same cell rather than recursing forever.
pub fn postprocess(wire: &Wire) -> Result<Value, MeshError> {
    let mut registry: HashMap<u32, Arc<RwLock<Value>>> = HashMap::new();
    postprocess_inner(wire, &mut registry)
}

fn postprocess_inner(
    wire: &Wire,
    registry: &mut HashMap<u32, Arc<RwLock<Value>>>,
) -> Result<Value, MeshError> {
    Ok(match wire {
        Wire::Null => Value::Null,
        Wire::Bool(b) => Value::Bool(*b),
        Wire::Int(i) => Value::Int(*i),
        Wire::Float(f) => Value::Float(*f),
        Wire::Str(s) => Value::Str(s.clone()),
        Wire::Bytes(b) => Value::Bytes(b.to_vec()),
        Wire::BigInt(digits) => Value::BigInt(digits.clone()),
        Wire::Regex { pattern, flags } => Value::Regex {
            pattern: pattern.clone(),
            flags: flags.clone(),
        },
        Wire::Request { method, url, headers, body } => Value::Request {
            method: method.clone(),
            url: url.clone(),
            headers: headers.clone(),
            body: body.as_ref().map(|b| b.to_vec()),
        },
        Wire::Response { status, headers, body } => Value::Response {
            status: *status,
            headers: headers.clone(),
            body: body.as_ref().map(|b| b.to_vec()),
        },
        Wire::Array(items) => Value::Array(
            items
                .iter()
                .map(|w| postprocess_inner(w, registry))
                .collect::<Result<_, _>>()?,
        ),
        Wire::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| {
                    Ok((
                        postprocess_inner(k, registry)?,
                        postprocess_inner(v, registry)?,
                    ))
                })
                .collect::<Result<_, MeshError>>()?,
        ),
        Wire::Set(items) => Value::Set(
            items
                .iter()
                .map(|w| postprocess_inner(w, registry))
                .collect::<Result<_, _>>()?,
        ),
        Wire::Date(millis) => {
            Value::Date(DateTime::from_timestamp_millis(*millis).unwrap_or_default())
        }
        Wire::Error(we) => Value::Error(postprocess_error(we, registry)?),
        Wire::NestedOperationChain(wc) => Value::NestedOperationChain(postprocess_chain(wc)?),
        Wire::ResultPlaceholder => Value::ResultPlaceholder,
        Wire::Def(id, inner) => {
            let cell = Arc::new(RwLock::new(Value::Null));
            registry.insert(*id, cell.clone());
            let resolved = postprocess_inner(inner, registry)?;
            *cell.write() = resolved;
            Value::Shared(cell)
        }
        Wire::Ref(id) => {
            let cell = registry.get(id).ok_or_else(|| MeshError::Serialization {
                path: "$".to_string(),
                message: format!("dangling back-reference {id}"),
            })?;
            Value::Shared(cell.clone())
        }
    })
}

fn postprocess_error(
    we: &WireError,
    registry: &mut HashMap<u32, Arc<RwLock<Value>>>,
) -> Result<ErrorValue, MeshError> {
    Ok(ErrorValue {
        class: we.class.clone(),
        message: we.message.clone(),
        properties: we
            .properties
            .iter()
            .map(|(k, v)| Ok((k.clone(), postprocess_inner(v, registry)?)))
            .collect::<Result<_, MeshError>>()?,
    })
}

/// Converts an [`OperationChain`] into its wire form (only `Apply`'s
/// arguments need the `Value`→`Wire` machinery; `Get`'s `Key` is already
/// directly `serde`-derivable).
pub fn preprocess_chain(chain: &OperationChain) -> Result<WireChain, MeshError> {
    let mut seen: HashMap<usize, u32> = HashMap::new();
    let mut next_id = 0u32;
    chain
        .0
        .iter()
        .map(|op| match op {
            Operation::Get(key) => Ok(WireOperation::Get(key.clone())),
            Operation::Apply(args) => Ok(WireOperation::Apply(
                args.iter()
                    .map(|v| preprocess_inner(v, &mut seen, &mut next_id))
                    .collect::<Result<_, MeshError>>()?,
            )),
        })
        .collect()
}

pub fn postprocess_chain(wire: &WireChain) -> Result<OperationChain, MeshError> {
    let mut registry: HashMap<u32, Arc<RwLock<Value>>> = HashMap::new();
    let steps = wire
        .iter()
        .map(|op| match op {
            WireOperation::Get(key) => Ok(Operation::Get(key.clone())),
            WireOperation::Apply(args) => Ok(Operation::Apply(
                args.iter()
                    .map(|w| postprocess_inner(w, &mut registry))
                    .collect::<Result<_, MeshError>>()?,
            )),
        })
        .collect::<Result<_, MeshError>>()?;
    Ok(OperationChain(steps))
}

/// Implemented by application-defined error types that should round-trip
/// through the wire under their own class name (testable property 13).
pub trait ClassError: std::error::Error + Send + Sync + 'static {
    const CLASS_NAME: &'static str;

    fn to_error_value(&self) -> ErrorValue;
    fn from_error_value(ev: &ErrorValue) -> Result<Self, MeshError>
    where
        Self: Sized;
}

type DecodeFn = Box<dyn Fn(&ErrorValue) -> BoxError + Send + Sync>;

/// Process-wide registry of custom error classes, keyed by wire class name.
/// Encoding never touches the registry — `ClassError::to_error_value` is
/// called directly by the thrower before the error is boxed. The registry
/// only serves decoding, sidestepping the need to recover a `TypeId` from
/// an already-erased `&dyn Error`.
pub struct ErrorRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

static GLOBAL_REGISTRY: OnceLock<ErrorRegistry> = OnceLock::new();

/// An error class absent from both the built-in taxonomy and the
/// [`ErrorRegistry`]; carries the original class name and message forward
/// (spec.md §4.1 "otherwise it constructs a generic error").
#[derive(Debug)]
pub struct GenericMeshError {
    pub class: String,
    pub message: String,
}

impl std::fmt::Display for GenericMeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for GenericMeshError {}

impl ErrorRegistry {
    pub fn global() -> &'static ErrorRegistry {
        GLOBAL_REGISTRY.get_or_init(|| ErrorRegistry {
            decoders: RwLock::new(HashMap::new()),
        })
    }

    pub fn register<E: ClassError>(&self) {
        let decoder: DecodeFn = Box::new(|ev: &ErrorValue| -> BoxError {
            match E::from_error_value(ev) {
                Ok(e) => Box::new(e),
                Err(err) => Box::new(err),
            }
        });
        self.decoders
            .write()
            .insert(E::CLASS_NAME.to_string(), decoder);
    }

    pub fn decode(&self, ev: &ErrorValue) -> BoxError {
        if let Some(decoder) = self.decoders.read().get(&ev.class) {
            return decoder(ev);
        }
        Box::new(GenericMeshError {
            class: ev.class.clone(),
            message: ev.message.clone(),
        })
    }
}
