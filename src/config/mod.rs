//! Stack description module.
//!
//! This module handles everything about the declarative input:
//! - Parsing and deserializing `stackwright.yaml`
//! - The resource type catalogue (replacement triggers, exports)
//! - Validation of description values
//! - Computing spec hashes and idempotency tokens

mod catalog;
mod spec;
mod parser;
mod validator;
mod hash;

pub use catalog::ResourceType;
pub use spec::{
    ApplySettings, PropertyValue, ProviderConfig, ProviderKind, Reference, ResourceDecl,
    SCHEMA_VERSION, StackConfig, StackDescription, StateBackend, StateConfig,
};
pub use parser::{DescriptionParser, PROVIDER_TOKEN_VAR, find_config_file};
pub use validator::{DescriptionValidator, ValidationResult};
pub use hash::SpecHasher;
