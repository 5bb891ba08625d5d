//! # repe-registry
//!
//! A hierarchical name tree addressed by JSON Pointer (RFC 6901),
//! dispatching REPE requests as reads, writes, or calls:
//! - empty body: read the value at the pointer (callables return a
//!   function descriptor)
//! - non-empty body on a callable: call it with the decoded arguments
//! - non-empty body elsewhere: replace the value at the pointer

pub mod error;
pub mod pointer;
pub mod registry;
pub mod serve;

pub use error::RegistryError;
pub use pointer::parse_pointer;
pub use registry::{Callable, Entry, Registry, Resolved};
pub use serve::serve;
