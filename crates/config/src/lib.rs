//! Configuration loading, env substitution and validation.
//!
//! Config files: `codehost.toml`, `codehost.yaml`, or `codehost.json`
//! Searched in `./` then `~/.config/codehost/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, database_url, discover_and_load,
        find_config_file, load_config, load_from,
    },
    schema::{
        CodehostConfig, DatabaseConfig, HostsConfig, PortRange, ReadinessConfig, ReapConfig,
        SwarmConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
