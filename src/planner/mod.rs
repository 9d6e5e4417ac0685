//! Planning module for provisioning operations.
//!
//! This module compares the desired resource graph with the provisioned
//! state, builds an ordered plan and executes it against a provider.

mod diff;
mod plan;
mod executor;

pub use diff::{DEPENDS_ON_FIELD, DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use plan::{OpKind, Plan, PlanOp};
pub use executor::{ApplyReport, OpOutcome, OpStatus, PlanExecutor, RetryPolicy};
