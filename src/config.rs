// Runtime configuration from environment variables
//
// Every setting has a logged default except the places API key, which is
// optional (nearby search is disabled without it).

use anyhow::{anyhow, Result};
use std::{env, fmt::Display, path::PathBuf, str::FromStr};
use tracing::{info, warn};

use crate::aggregate::DEFAULT_MAX_ATTEMPTS;
use crate::places::DEFAULT_RADIUS_METERS;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub database_path: PathBuf,
    pub max_txn_attempts: u32,
    pub places_radius: u32,
    pub places_api_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup (environment, map in tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            port: try_load(&lookup, "SPOT_PORT", "3000")?,
            database_path: try_load(&lookup, "SPOT_DATABASE", "spot-reviews.db")?,
            max_txn_attempts: try_load(
                &lookup,
                "SPOT_MAX_TXN_ATTEMPTS",
                &DEFAULT_MAX_ATTEMPTS.to_string(),
            )?,
            places_radius: try_load(
                &lookup,
                "SPOT_PLACES_RADIUS",
                &DEFAULT_RADIUS_METERS.to_string(),
            )?,
            places_api_key: lookup("GOOGLE_MAPS_KEY").filter(|key| !key.is_empty()),
        })
    }
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T>
where
    T::Err: Display,
{
    lookup(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
            anyhow!("Invalid {key} value: {e}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_path, PathBuf::from("spot-reviews.db"));
        assert_eq!(config.max_txn_attempts, 5);
        assert_eq!(config.places_radius, 1500);
        assert!(config.places_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SPOT_PORT", "8080"),
            ("SPOT_DATABASE", "/tmp/reviews.db"),
            ("SPOT_MAX_TXN_ATTEMPTS", "12"),
            ("GOOGLE_MAPS_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_path, PathBuf::from("/tmp/reviews.db"));
        assert_eq!(config.max_txn_attempts, 12);
        assert_eq!(config.places_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = config_from(&[("SPOT_PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("SPOT_PORT"));
    }
}
