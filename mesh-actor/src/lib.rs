//! Host collaborator traits, the mesh dispatcher, actor base types and an
//! in-memory test harness for the mesh RPC fabric (spec.md §4.4–§6).

pub mod actor;
pub mod dispatch;
pub mod host;
pub mod testing;
