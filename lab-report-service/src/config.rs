use dotenvy::dotenv;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_VISION_MODEL: &str = "openai/gpt-4.1-mini";
pub const DEFAULT_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_TEMPERATURE: f64 = 0.0;
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings, read from the environment (and `.env` when present)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub api_key: String,
    pub llm_model: String,
    pub vision_model: String,
    pub temperature: f64,
    pub timeout: Duration,
    pub port: u16,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key =
            get("OPENROUTER_API_KEY").ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;

        let config = Self {
            api_key,
            llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            vision_model: get("VISION_MODEL").unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            temperature: parse_or(
                "LLM_TEMPERATURE",
                get("LLM_TEMPERATURE"),
                DEFAULT_TEMPERATURE,
            )?,
            timeout: Duration::from_secs(parse_or(
                "LLM_TIMEOUT_SECS",
                get("LLM_TIMEOUT_SECS"),
                DEFAULT_TIMEOUT_SECS,
            )?),
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                name: "LLM_TEMPERATURE",
                value: self.temperature.to_string(),
                reason: "must be between 0.0 and 2.0".to_string(),
            });
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "LLM_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_apply() {
        let config = config_from(&[("OPENROUTER_API_KEY", "key")]).unwrap();
        assert_eq!(config.llm_model, DEFAULT_LLM_MODEL);
        assert_eq!(config.vision_model, DEFAULT_VISION_MODEL);
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_api_key_is_required() {
        assert_eq!(
            config_from(&[("OPENROUTER_API_KEY", "  ")]).unwrap_err(),
            ConfigError::Missing("OPENROUTER_API_KEY")
        );
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("OPENROUTER_API_KEY", "key"),
            ("LLM_MODEL", "anthropic/claude-3.5-haiku"),
            ("LLM_TIMEOUT_SECS", "90"),
            ("LLM_TEMPERATURE", "0.2"),
            ("PORT", "8080"),
        ])
        .unwrap();
        assert_eq!(config.llm_model, "anthropic/claude-3.5-haiku");
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = config_from(&[("OPENROUTER_API_KEY", "key"), ("PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));

        let err =
            config_from(&[("OPENROUTER_API_KEY", "key"), ("LLM_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "LLM_TIMEOUT_SECS", .. }));

        let err =
            config_from(&[("OPENROUTER_API_KEY", "key"), ("LLM_TEMPERATURE", "5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "LLM_TEMPERATURE", .. }));
    }
}
