use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::Serialize;
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};

/// Values given on the command line; they win over files and environment
#[derive(Debug, Clone, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

/// Load configuration: defaults, then a config file, then `HTTPTAP_*` environment
/// variables, then command-line overrides.
///
/// Without an explicit path, `httptap.{toml,yaml,yml,json}` in the working directory
/// are picked up when present. Nested keys use a double underscore, e.g.
/// `HTTPTAP_PERSISTENCE__WORKERS=4`.
pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> Result<Config> {
    let figment = Figment::from(Serialized::defaults(Config::default()));

    let figment = match path {
        Some(path) => match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("json") => figment.merge(Json::file(path)),
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            _ => {
                return Err(ConfigError::Parse(
                    "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
                )
                .into())
            }
        },
        None => figment
            .merge(Toml::file("httptap.toml"))
            .merge(Json::file("httptap.json"))
            .merge(Yaml::file("httptap.yaml"))
            .merge(Yaml::file("httptap.yml")),
    };

    let config: Config = figment
        .merge(Env::prefixed("HTTPTAP_").split("__"))
        .merge(Serialized::defaults(overrides))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.listen_addr()?;

    if config.database.trim().is_empty() {
        return Err(ConfigError::Validation("Database path must not be empty".into()).into());
    }

    if config.persistence.workers == 0 {
        return Err(ConfigError::Validation(
            "Persistence worker count must be greater than 0".into(),
        )
        .into());
    }

    if config.persistence.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "Persistence queue capacity must be greater than 0".into(),
        )
        .into());
    }

    if config.persistence.write_timeout_ms == 0 {
        return Err(
            ConfigError::Validation("Write timeout must be greater than 0".into()).into(),
        );
    }

    // A pending request body must outlive the slowest exchange it can belong to
    if config.capture.pending_ttl() <= config.upstream_timeout() {
        return Err(ConfigError::Validation(format!(
            "Pending TTL ({}s) must be longer than the upstream timeout ({}ms)",
            config.capture.pending_ttl_secs, config.upstream_timeout_ms
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.database = substitute_env_vars(&config.database)?;

    if let Some(ca_dir) = &config.tls.ca_dir {
        if let Some(raw) = ca_dir.to_str() {
            config.tls.ca_dir = Some(substitute_env_vars(raw)?.into());
        }
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {}", e)))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }
        match std::env::var(var_name) {
            Ok(value) => result = result.replace(&cap[0], &value),
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}
