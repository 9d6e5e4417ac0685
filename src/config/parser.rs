//! Description parser for loading stack descriptions.
//!
//! This module handles loading descriptions from YAML files, the `.env` file
//! next to them and environment variable overrides.

use crate::error::{ConfigError, Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{SCHEMA_VERSION, StackDescription};

/// Environment variable holding the provisioning API token.
pub const PROVIDER_TOKEN_VAR: &str = "STACKWRIGHT_PROVIDER_TOKEN";

/// Parser for loading stack descriptions.
#[derive(Debug, Default)]
pub struct DescriptionParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl DescriptionParser {
    /// Creates a new description parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a description from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackDescription> {
        let path = path.as_ref();
        info!("Loading stack description from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a description from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or uses an unsupported schema
    /// version.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackDescription> {
        debug!("Parsing YAML stack description");

        let description: StackDescription = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .or_else(|| source.map(|p| p.display().to_string()));
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        if description.version != SCHEMA_VERSION {
            return Err(StackError::Config(ConfigError::UnsupportedVersion {
                found: description.version,
                supported: SCHEMA_VERSION,
            }));
        }

        debug!(
            "Parsed stack {} with {} resources",
            description.qualified_name(),
            description.resources.len()
        );
        Ok(description)
    }

    /// Loads a description and applies environment variable overrides.
    ///
    /// `STACKWRIGHT_PREFIX`, `STACKWRIGHT_STAGE` and `STACKWRIGHT_REGION`
    /// win over the file; the bare `PREFIX` and `STAGE` variables are honoured
    /// when the prefixed ones are absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackDescription> {
        let mut description = self.load_file(path)?;
        Self::apply_overrides(&mut description, |name| std::env::var(name).ok());
        Ok(description)
    }

    /// Applies overrides from `lookup` to the description.
    pub fn apply_overrides<F>(description: &mut StackDescription, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(name));

        if let Some(prefix) = first(&["STACKWRIGHT_PREFIX", "PREFIX"]) {
            debug!("Overriding stack.prefix from environment");
            description.stack.prefix = prefix;
        }

        if let Some(stage) = first(&["STACKWRIGHT_STAGE", "STAGE"]) {
            debug!("Overriding stack.stage from environment");
            description.stack.stage = stage;
        }

        if let Some(region) = first(&["STACKWRIGHT_REGION"]) {
            debug!("Overriding stack.region from environment");
            description.stack.region = Some(region);
        }

        if let Some(bucket) = first(&["STACKWRIGHT_STATE_BUCKET"]) {
            debug!("Overriding state.bucket from environment");
            description.state.bucket = Some(bucket);
        }

        if let Some(endpoint) = first(&["STACKWRIGHT_PROVIDER_ENDPOINT"]) {
            debug!("Overriding provider.endpoint from environment");
            description.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provisioning API token from environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn provider_token() -> Result<String> {
        std::env::var(PROVIDER_TOKEN_VAR).map_err(|_| {
            StackError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_VAR),
            })
        })
    }
}

/// Default description file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackwright.yaml",
    "stackwright.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the description file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no description file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack description: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
