use anyhow::{bail, Context};

/// Bump whenever the estimator changes in a way that alters persisted rows.
/// Rows stamped with any other version are rebuilt on their next read.
pub const TREND_MODEL_VERSION: i32 = 1;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_version: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_version: TREND_MODEL_VERSION,
        }
    }
}

impl EngineConfig {
    pub fn with_model_version(model_version: i32) -> Self {
        Self { model_version }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL").filter(|value| !value.trim().is_empty());

        let max_connections = match lookup("WEIGHT_TREND_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("WEIGHT_TREND_MAX_CONNECTIONS is not a number: {raw}"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            bail!("WEIGHT_TREND_MAX_CONNECTIONS must be at least 1");
        }

        let engine = match lookup("WEIGHT_TREND_MODEL_VERSION") {
            Some(raw) => {
                let version = raw
                    .trim()
                    .parse::<i32>()
                    .with_context(|| format!("WEIGHT_TREND_MODEL_VERSION is not a number: {raw}"))?;
                if version < 1 {
                    bail!("WEIGHT_TREND_MODEL_VERSION must be positive, got {version}");
                }
                EngineConfig::with_model_version(version)
            }
            None => EngineConfig::default(),
        };

        Ok(Self {
            database_url,
            max_connections,
            engine,
        })
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.database_url().is_err());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.engine.model_version, TREND_MODEL_VERSION);
    }

    #[test]
    fn reads_overrides() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/trend"),
            ("WEIGHT_TREND_MAX_CONNECTIONS", "12"),
            ("WEIGHT_TREND_MODEL_VERSION", "3"),
        ]))
        .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgres://localhost/trend");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.engine, EngineConfig::with_model_version(3));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(AppConfig::from_lookup(lookup_from(&[("WEIGHT_TREND_MAX_CONNECTIONS", "0")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("WEIGHT_TREND_MAX_CONNECTIONS", "many")])).is_err());
        assert!(AppConfig::from_lookup(lookup_from(&[("WEIGHT_TREND_MODEL_VERSION", "0")])).is_err());
    }

    #[test]
    fn blank_database_url_counts_as_missing() {
        let config = AppConfig::from_lookup(lookup_from(&[("DATABASE_URL", "  ")])).unwrap();
        assert!(config.database_url.is_none());
    }
}
