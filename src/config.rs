//! Configuration loading and schema definitions for testdeps.
//!
//! Configuration comes from two layers:
//!
//! 1. An optional TOML file (path from `TESTDEPS_CONFIG`, otherwise
//!    `testdeps.toml` in the current directory if it exists).
//! 2. Environment toggles, which always win over the file:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `USE_EXTERNAL_<PREFIX>` | Use a pre-existing endpoint for that kind |
//! | `<PREFIX>_URL` | Address of that endpoint |
//! | `REUSE_ACROSS_RUNS` | Keep instances alive after the last release |
//! | `DEBUG_TESTDEPS` | Verbose logging |
//!
//! `<PREFIX>` is `ES`, `MONGO` or `PG` for the built-in kinds.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::kind::{env_prefix_for, ResourceKind};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TESTDEPS_CONFIG";

/// Configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "testdeps.toml";

/// Environment variable enabling verbose logging.
pub const DEBUG_ENV: &str = "DEBUG_TESTDEPS";

/// Environment variable controlling the reuse policy.
pub const REUSE_ENV: &str = "REUSE_ACROSS_RUNS";

/// Loads testdeps configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testdeps::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testdeps.toml"))?;
/// println!("Reuse: {}", config.settings.reuse_across_runs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testdeps configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testdeps::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [settings]
///     startup_timeout_secs = 120
/// "#)?;
///
/// assert_eq!(config.settings.startup_timeout_secs, 120);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the effective configuration for this process.
///
/// Reads the file named by `TESTDEPS_CONFIG` (an error if it is set but
/// unreadable), falls back to `testdeps.toml` when present, otherwise starts
/// from defaults. Environment toggles are applied last.
pub fn load_from_env() -> Result<Config> {
    let mut config = match std::env::var(CONFIG_ENV) {
        Ok(path) => load_config(&expand_path(&path))?,
        Err(_) => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                load_config(default_path)?
            } else {
                Config::default()
            }
        }
    };
    apply_env(&mut config);
    Ok(config)
}

/// Applies environment toggles from the process environment.
pub fn apply_env(config: &mut Config) {
    apply_env_with(config, |key| std::env::var(key).ok());
}

/// Applies environment toggles using an arbitrary lookup.
pub fn apply_env_with<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(reuse) = lookup_bool(&lookup, REUSE_ENV) {
        config.settings.reuse_across_runs = reuse;
    }
    if let Some(debug) = lookup_bool(&lookup, DEBUG_ENV) {
        config.settings.debug = debug;
    }

    for kind in ResourceKind::BUILTIN {
        apply_kind_env(config, kind, &lookup);
    }
    let custom: Vec<String> = config
        .resources
        .keys()
        .filter(|key| ResourceKind::parse(key).is_none())
        .cloned()
        .collect();
    for key in custom {
        apply_prefixed_env(config, &key, &env_prefix_for(&key), &lookup);
    }
}

fn apply_kind_env<F>(config: &mut Config, kind: ResourceKind, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    apply_prefixed_env(config, kind.key(), &kind.env_prefix(), lookup);
}

fn apply_prefixed_env<F>(config: &mut Config, key: &str, prefix: &str, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    let use_external = lookup_bool(lookup, &format!("USE_EXTERNAL_{}", prefix));
    let url = lookup(&format!("{}_URL", prefix)).filter(|u| !u.trim().is_empty());

    if use_external.is_none() && url.is_none() {
        return;
    }

    let overrides = config.resources.entry(key.to_string()).or_default();
    if let Some(use_external) = use_external {
        overrides.use_external = Some(use_external);
    }
    if let Some(url) = url {
        overrides.external_url = Some(url);
    }
}

fn lookup_bool<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        warn!("Ignoring {}={:?}: not a boolean", key, raw);
    }
    parsed
}

/// Parses the boolean spellings accepted by the environment toggles.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Expands `~` and environment variables in a path from configuration.
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(path),
    }
}
