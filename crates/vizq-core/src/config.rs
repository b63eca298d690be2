use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const DEFAULT_CACHE_TIMEOUT_SECONDS: u64 = 86_400;
pub const DEFAULT_SAMPLES_ROW_LIMIT: usize = 1_000;

/// Process-wide settings handed to every [`crate::QueryContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContextConfig {
    /// Fallback cache timeout in seconds; `0` stores without expiry.
    pub cache_default_timeout: u64,
    /// Mixes row-level-security ids into per-query cache keys.
    pub row_level_security: bool,
    pub samples_row_limit: usize,
    pub csv_delimiter: char,
    /// Coerce untyped metric columns to numbers after a fetch.
    pub enforce_numerical_metrics: bool,
}

impl Default for QueryContextConfig {
    fn default() -> Self {
        Self {
            cache_default_timeout: DEFAULT_CACHE_TIMEOUT_SECONDS,
            row_level_security: false,
            samples_row_limit: DEFAULT_SAMPLES_ROW_LIMIT,
            csv_delimiter: ',',
            enforce_numerical_metrics: true,
        }
    }
}

impl QueryContextConfig {
    /// Defaults overlaid with `VIZQ_*` environment variables.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("VIZQ_CACHE_DEFAULT_TIMEOUT") {
            config.cache_default_timeout =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ValidationError::InvalidConfig {
                        key: "VIZQ_CACHE_DEFAULT_TIMEOUT",
                        value: value.clone(),
                    })?;
        }

        if let Some(value) = lookup("VIZQ_ROW_LEVEL_SECURITY") {
            config.row_level_security = parse_flag(&value).ok_or_else(|| {
                ValidationError::InvalidConfig {
                    key: "VIZQ_ROW_LEVEL_SECURITY",
                    value: value.clone(),
                }
            })?;
        }

        if let Some(value) = lookup("VIZQ_SAMPLES_ROW_LIMIT") {
            config.samples_row_limit = value
                .trim()
                .parse()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| ValidationError::InvalidConfig {
                    key: "VIZQ_SAMPLES_ROW_LIMIT",
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup("VIZQ_CSV_DELIMITER") {
            let mut chars = value.chars();
            config.csv_delimiter = match (chars.next(), chars.next()) {
                (Some(delimiter), None) if delimiter.is_ascii() => delimiter,
                _ => {
                    return Err(ValidationError::InvalidConfig {
                        key: "VIZQ_CSV_DELIMITER",
                        value,
                    })
                }
            };
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let config = QueryContextConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, QueryContextConfig::default());
        assert_eq!(config.cache_default_timeout, 86_400);
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let config = QueryContextConfig::from_lookup(lookup(&[
            ("VIZQ_CACHE_DEFAULT_TIMEOUT", "60"),
            ("VIZQ_ROW_LEVEL_SECURITY", "true"),
            ("VIZQ_SAMPLES_ROW_LIMIT", "25"),
            ("VIZQ_CSV_DELIMITER", ";"),
        ]))
        .expect("config");

        assert_eq!(config.cache_default_timeout, 60);
        assert!(config.row_level_security);
        assert_eq!(config.samples_row_limit, 25);
        assert_eq!(config.csv_delimiter, ';');
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = QueryContextConfig::from_lookup(lookup(&[("VIZQ_SAMPLES_ROW_LIMIT", "0")]))
            .expect_err("must fail");
        assert!(matches!(
            err,
            ValidationError::InvalidConfig {
                key: "VIZQ_SAMPLES_ROW_LIMIT",
                ..
            }
        ));
    }
}
