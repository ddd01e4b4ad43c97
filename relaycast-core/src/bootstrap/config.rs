//! Configuration loading

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::Config;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "RELAYCAST_CONFIG_PATH";

/// Load configuration from a config file and the environment
///
/// A `.env` file in the working directory is applied to the process
/// environment first, when present.
///
/// Config file search order:
/// 1. `explicit` (command line)
/// 2. `RELAYCAST_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. Fall back to environment variables only
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(anyhow::anyhow!("Failed to read .env file: {e}")),
    }

    let config_path = resolve_config_path(explicit);

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated successfully");

    Ok(config)
}

fn resolve_config_path(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins_when_present() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(resolve_config_path(Some(path)).as_deref(), Some(path));
    }

    #[test]
    fn test_missing_explicit_path_is_skipped() {
        let resolved = resolve_config_path(Some("/definitely/not/here.yaml"));
        assert_ne!(resolved.as_deref(), Some("/definitely/not/here.yaml"));
    }
}
