use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CodehostConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "codehost.toml",
    "codehost.yaml",
    "codehost.yml",
    "codehost.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CodehostConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply `CODEHOST_*`
/// environment overrides.
///
/// Search order:
/// 1. `./codehost.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/codehost/codehost.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to `CodehostConfig::default()` if no config file is found or the
/// file fails to parse.
pub fn discover_and_load() -> CodehostConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                CodehostConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            CodehostConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Load an explicitly named config file (no discovery) and apply env overrides.
///
/// Unlike [`discover_and_load`], a file the user pointed at must parse.
pub fn load_from(path: &Path) -> anyhow::Result<CodehostConfig> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/codehost/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "codehost").map(|d| d.config_dir().to_path_buf())
}

/// Returns the data directory holding the default database.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "codehost")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Database URL from config, or the default sqlite file under [`data_dir`].
pub fn database_url(config: &CodehostConfig) -> String {
    match config.database.url {
        Some(ref url) => url.clone(),
        None => format!("sqlite:{}?mode=rwc", data_dir().join("codehost.db").display()),
    }
}

/// Apply `CODEHOST_*` environment variables on top of a loaded config.
pub fn apply_env_overrides(config: &mut CodehostConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(config: &mut CodehostConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CODEHOST_HOSTNAME") {
        config.hosts.hostname = Some(v);
    }
    if let Some(v) = lookup("CODEHOST_REPORTING_URL") {
        config.hosts.reporting_url = Some(v);
    }
    if let Some(v) = lookup("CODEHOST_NETWORK") {
        config.hosts.network = Some(v);
    }
    if let Some(v) = lookup("CODEHOST_STORAGE_DIR") {
        config.hosts.storage_dir = Some(v);
    }
    if let Some(v) = lookup("CODEHOST_DATABASE_URL") {
        config.database.url = Some(v);
    }
    if let Some(v) = lookup("DOCKER_HOST") {
        config.swarm.host.get_or_insert(v);
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CodehostConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
