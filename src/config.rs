//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::compiler::CompilerSettings;

const CONFIG_FILE: &str = ".orka-runner.toml";

/// Runner configuration derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "ORKA")]
pub struct RunnerConfig {
    /// Base URL of the Orka API, for example `http://10.221.188.100`.
    #[ortho_config(default = String::new())]
    pub endpoint: String,
    /// Bearer token for the Orka API.
    #[ortho_config(default = String::new())]
    pub token: String,
    /// Default VM image used when a pipeline does not name one.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// CPU cores requested for each VM. Defaults to 12.
    #[ortho_config(default = 12)]
    pub compute: u32,
    /// Remote shell user. Defaults to `admin`.
    #[ortho_config(default = "admin".to_owned())]
    pub username: String,
    /// Remote shell password.
    #[ortho_config(default = String::new())]
    pub password: String,
    /// Logs every Orka request and response body at trace level.
    #[ortho_config(default = false)]
    pub debug_http: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl RunnerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to {CONFIG_FILE}",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and environment
    /// variables. Command-line arguments belong to the subcommand parser and
    /// are never read here.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("orka-runner")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the compiler defaults carried by this configuration.
    ///
    /// Only the VM fields are checked; compiling never contacts the API, so
    /// the endpoint, token, and password may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the image, user, or compute value is
    /// unusable.
    pub fn compiler_settings(&self) -> Result<CompilerSettings, ConfigError> {
        self.validate_vm()?;
        Ok(CompilerSettings {
            image: self.image.clone(),
            compute: self.compute,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty and
    /// [`ConfigError::Invalid`] when the endpoint or compute value is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.endpoint,
            &FieldMetadata::new("Orka API endpoint", "ORKA_ENDPOINT", "endpoint"),
        )?;
        Self::require_field(
            &self.token,
            &FieldMetadata::new("Orka API token", "ORKA_TOKEN", "token"),
        )?;
        self.validate_vm()?;
        Self::require_field(
            &self.password,
            &FieldMetadata::new("remote shell password", "ORKA_PASSWORD", "password"),
        )?;
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "ORKA_ENDPOINT must be an http(s) URL, got `{}`",
                self.endpoint
            )));
        }
        Ok(())
    }

    fn validate_vm(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.image,
            &FieldMetadata::new("VM image", "ORKA_IMAGE", "image"),
        )?;
        Self::require_field(
            &self.username,
            &FieldMetadata::new("remote shell user", "ORKA_USERNAME", "username"),
        )?;
        if self.compute == 0 {
            return Err(ConfigError::Invalid(String::from(
                "ORKA_COMPUTE must be at least 1",
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value the runner cannot use.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
