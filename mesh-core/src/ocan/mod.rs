//! OCAN — Operation Chaining And Nesting (spec.md §4.2, component C2/C3).

pub mod builder;
pub mod executor;

pub use builder::Ctn;
pub use executor::{execute, ExecutorConfig};
