//! Resource graph module.
//!
//! This module turns declarations into a dependency graph:
//! - Building validated resource specs and edges
//! - Ordering them topologically with deterministic tie-breaking
//! - Detecting cycles and naming their participants

mod builder;
mod resolver;
mod types;

pub use builder::GraphBuilder;
pub use resolver::DependencyResolver;
pub use types::{ResourceGraph, ResourceId, ResourceSpec};
