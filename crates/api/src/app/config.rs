//! Process configuration read from the environment.

use std::time::Duration;

use anyhow::{Context, Result};

/// Everything `main` needs to wire the service.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Postgres adapters when set, in-memory stores otherwise.
    pub database_url: Option<String>,
    pub ai_base_url: String,
    pub ai_api_key: Option<String>,
    /// Default model; jobs naming no model use it.
    pub ai_model: String,
    /// Further models jobs may select by name, served by the same endpoint.
    pub ai_models: Vec<String>,
    pub record_call_timeout: Duration,
    pub cluster_call_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            ai_base_url: "https://api.openai.com".to_string(),
            ai_api_key: None,
            ai_model: "gpt-4o-mini".to_string(),
            ai_models: Vec::new(),
            record_call_timeout: Duration::from_secs(60),
            cluster_call_timeout: Duration::from_secs(90),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: get("DATABASE_URL"),
            ai_base_url: get("AI_BASE_URL").unwrap_or(defaults.ai_base_url),
            ai_api_key: get("AI_API_KEY"),
            ai_model: get("AI_MODEL").unwrap_or(defaults.ai_model),
            ai_models: get("AI_MODELS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            record_call_timeout: seconds(get("AI_CALL_TIMEOUT_SECS"), "AI_CALL_TIMEOUT_SECS")?
                .unwrap_or(defaults.record_call_timeout),
            cluster_call_timeout: seconds(
                get("AI_CLUSTER_CALL_TIMEOUT_SECS"),
                "AI_CLUSTER_CALL_TIMEOUT_SECS",
            )?
            .unwrap_or(defaults.cluster_call_timeout),
        })
    }
}

fn seconds(value: Option<String>, key: &str) -> Result<Option<Duration>> {
    value
        .map(|v| {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a whole number of seconds, got `{v}`"))?;
            anyhow::ensure!(secs > 0, "{key} must be greater than zero");
            Ok(Duration::from_secs(secs))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<ApiConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.record_call_timeout, Duration::from_secs(60));
        assert_eq!(cfg.cluster_call_timeout, Duration::from_secs(90));
    }

    #[test]
    fn overrides_and_blank_values() {
        let cfg = config(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "  "),
            ("AI_MODEL", "local-model"),
            ("AI_MODELS", "azure-gpt4, ,local-large"),
            ("AI_CALL_TIMEOUT_SECS", "15"),
        ])
        .unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.ai_model, "local-model");
        assert_eq!(cfg.ai_models, vec!["azure-gpt4", "local-large"]);
        assert_eq!(cfg.record_call_timeout, Duration::from_secs(15));
    }

    #[test]
    fn bad_timeouts_are_rejected() {
        assert!(config(&[("AI_CALL_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config(&[("AI_CLUSTER_CALL_TIMEOUT_SECS", "0")]).is_err());
    }
}
