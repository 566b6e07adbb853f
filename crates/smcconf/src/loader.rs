//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, SmcConfig};
use std::env;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

/// Top-level key of the command list.
const COMMANDS: &str = "commands";

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/stream-my-command/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("stream-my-command/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("stream-my-command.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<SmcConfig, ConfigError> {
    config_from_table(load_table(path)?, path)
}

/// Read a TOML file as a raw table, for layering with [`merge_tables`].
///
/// The file is also checked against the config schema, so type errors are
/// reported against the file that caused them.
pub fn load_table(path: &Path) -> Result<Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table = parse_table(&contents, path)?;
    config_from_table(table.clone(), path)?;
    Ok(table)
}

/// Parse config from a TOML string. Missing sections and keys take defaults.
pub fn parse_toml(contents: &str, path: &Path) -> Result<SmcConfig, ConfigError> {
    config_from_table(parse_table(contents, path)?, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<Table, ConfigError> {
    contents.parse::<Table>().map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deserialize a (possibly merged) table. `path` names it in errors.
pub fn config_from_table(table: Table, path: &Path) -> Result<SmcConfig, ConfigError> {
    let mut config: SmcConfig = Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    // `~` and `$VAR` are only meaningful once we know which file we came from
    if let Some(raw) = config.infra.paths.state_dir.to_str().map(str::to_owned) {
        config.infra.paths.state_dir = expand_path(&raw);
    }

    Ok(config)
}

/// Layer `overlay` onto `base`. Every key present in `overlay` wins, even
/// when it restates a default; absent keys keep the base value.
///
/// Sections merge key by key. `[[commands]]` entries merge by slug: an
/// overlay entry replaces the base entry with the same slug, new slugs are
/// appended. Any other value is replaced whole.
pub fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        let replacement = match (base.get_mut(&key), value) {
            (Some(Value::Table(base)), Value::Table(overlay)) => {
                merge_tables(base, overlay);
                None
            }
            (Some(Value::Array(base)), Value::Array(overlay)) if key == COMMANDS => {
                merge_command_entries(base, overlay);
                None
            }
            (_, value) => Some(value),
        };
        if let Some(value) = replacement {
            base.insert(key, value);
        }
    }
}

fn merge_command_entries(base: &mut Vec<Value>, overlay: Vec<Value>) {
    fn slug(entry: &Value) -> Option<&str> {
        entry.get("slug").and_then(Value::as_str)
    }

    for entry in overlay {
        let existing = slug(&entry)
            .and_then(|wanted| base.iter().position(|b| slug(b) == Some(wanted)));
        match existing {
            Some(index) => base[index] = entry,
            None => base.push(entry),
        }
    }
}

/// Apply `SMC_*` environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SmcConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup. Unparsable values are ignored.
pub fn apply_overrides_from<F>(config: &mut SmcConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = |key: &str| sources.env_overrides.push(key.to_string());

    if let Some(v) = lookup("SMC_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        applied("SMC_STATE_DIR");
    }

    if let Some(v) = lookup("SMC_HOST") {
        config.infra.bind.host = v;
        applied("SMC_HOST");
    }
    if let Some(port) = lookup("SMC_HTTP_PORT").and_then(|v| v.parse().ok()) {
        config.infra.bind.http_port = port;
        applied("SMC_HTTP_PORT");
    }

    if let Some(v) = lookup("SMC_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        applied("SMC_LOG_LEVEL");
    }

    if let Some(size) = lookup("SMC_SEGMENT_SIZE").and_then(|v| v.parse().ok()) {
        config.infra.stream.segment_size = size;
        applied("SMC_SEGMENT_SIZE");
    }
    if let Some(ms) = lookup("SMC_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.infra.stream.poll_interval_ms = ms;
        applied("SMC_POLL_INTERVAL_MS");
    }
    if let Some(strategy) = lookup("SMC_WAIT_STRATEGY").and_then(|v| v.parse().ok()) {
        config.infra.stream.wait_strategy = strategy;
        applied("SMC_WAIT_STRATEGY");
    }
    if let Some(n) = lookup("SMC_MAX_CONCURRENT_COMMANDS").and_then(|v| v.parse().ok()) {
        config.infra.stream.max_concurrent_commands = n;
        applied("SMC_MAX_CONCURRENT_COMMANDS");
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
