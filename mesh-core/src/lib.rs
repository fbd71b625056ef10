//! Data model, operation chaining (OCAN), call-context propagation and
//! structured serialization for the mesh RPC fabric (spec.md §1–§6).

pub mod chain;
pub mod context;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod mesh_marker;
pub mod object;
pub mod ocan;
pub mod serialize;

pub use chain::{Key, Operation, OperationChain};
pub use context::{CallContext, OriginAuth};
pub use envelope::{CallEnvelope, CallResponse, EnvelopeMetadata, ENVELOPE_VERSION};
pub use error::{BoxError, MeshError};
pub use identity::{NodeIdentity, NodeKind};
pub use mesh_marker::{Guard, MeshRegistry};
pub use object::{MeshMarker, MeshMethod, MeshObject};
pub use ocan::{execute, Ctn, ExecutorConfig};
pub use serialize::{
    postprocess, postprocess_chain, postprocess_error_value, preprocess, preprocess_chain,
    preprocess_error_value, ClassError, ErrorRegistry, ErrorValue, Value, Wire, WireChain,
    WireError, WireOperation,
};
