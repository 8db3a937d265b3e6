//! Configuration management

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use lacework_common::ServerConfig;
use std::path::Path;

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "LACEWORK";

/// Load configuration: built-in defaults, then the file at `config_path`
/// if it exists, then `LACEWORK_*` environment variables.
///
/// Nested keys use a double underscore, e.g. `LACEWORK_DATABASE__URL`.
pub fn load_config(config_path: &str) -> Result<ServerConfig> {
    let defaults = Config::try_from(&ServerConfig::default())
        .context("Failed to serialize default configuration")?;

    let config: ServerConfig = Config::builder()
        .add_source(defaults)
        .add_source(File::from(Path::new(config_path)).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration from {}", config_path))?
        .try_deserialize()
        .with_context(|| format!("Failed to parse configuration from {}", config_path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml").to_str().unwrap()).unwrap();

        assert_eq!(config.bind_address.port(), 4103);
        assert_eq!(config.network.subnet_range, "10.255.0.0/16");
        assert_eq!(config.database.driver, "sqlite");
        config.validate().unwrap();
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lacework.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
bind_address = "127.0.0.1:9000"

[database]
driver = "postgres"
url = "postgres://lacework@db/lacework"

[network]
subnet_range = "10.32.0.0/12"

[leases]
expiration_seconds = 120
"#
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.database.driver, "postgres");
        assert_eq!(config.database.timeout_secs, 5);
        assert_eq!(config.network.subnet_range, "10.32.0.0/12");
        assert_eq!(config.network.subnet_prefix_length, 24);
        assert_eq!(config.leases.expiration_seconds, 120);
        assert_eq!(config.leases.sweep_interval_secs, 60);
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("LACEWORK_LEASES__ACQUIRE_MAX_ATTEMPTS", "9");
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml").to_str().unwrap()).unwrap();
        std::env::remove_var("LACEWORK_LEASES__ACQUIRE_MAX_ATTEMPTS");

        assert_eq!(config.leases.acquire_max_attempts, 9);
    }
}
