// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Tests may unwrap freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A declarative, dependency-ordered plan/apply engine for networked
//! container stacks.
//!
//! ## Overview
//!
//! Stackwright turns a YAML description of interdependent resources
//! (networks, subnets, clusters, services, load balancers, scaling policies)
//! into an ordered set of provisioning operations, and applies them with
//! retries and persistent state:
//!
//! - Describe the stack as code in `stackwright.yaml`
//! - Preview every create, update, replace and delete before it happens
//! - Apply with bounded concurrency, idempotency tokens and backoff
//! - Resume safely: state is written after every operation
//!
//! ## Architecture
//!
//! 1. **Description**: parsed and validated into typed declarations
//! 2. **Graph**: references become edges, resolved into a deterministic order
//! 3. **Plan**: desired graph diffed against recorded state
//! 4. **Apply**: the plan is executed against a [`provider::Provider`]
//!
//! ## Modules
//!
//! - [`config`]: Description parsing, resource catalogue, validation, hashing
//! - [`graph`]: Resource graph construction and dependency resolution
//! - [`planner`]: Diff computation, planning and plan execution
//! - [`provider`]: Provisioning collaborators (sandbox, HTTP)
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`reconciler`]: Ties planning and execution to state under a lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! version: 1
//! stack:
//!   prefix: shop
//!   stage: prod
//!
//! resources:
//!   vpc:
//!     type: network
//!     properties:
//!       cidr: 10.0.0.0/16
//!   cluster:
//!     type: cluster
//!     properties:
//!       network: { ref: vpc.id }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{DescriptionParser, DescriptionValidator, SpecHasher, StackDescription};
pub use error::{Result, StackError};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{ApplyReport, DiffEngine, Plan, PlanExecutor};
pub use provider::{HttpProvider, Provider, SandboxProvider};
pub use reconciler::Reconciler;
pub use state::{LocalStateStore, ProvisionedState, S3StateStore, StateStore};
