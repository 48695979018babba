//! Controller configuration.

use std::path::PathBuf;
use std::time::Duration;

use cnap_runner::{InvokeError, OpenCodeInvoker, API_KEY_ENV, DEFAULT_ENDPOINT};
use tracing::warn;

pub const ENDPOINT_ENV: &str = "CNAP_MODEL_ENDPOINT";
pub const TIMEOUT_ENV: &str = "CNAP_INVOKE_TIMEOUT_SECS";
pub const DATA_DIR_ENV: &str = "CNAP_DATA_DIR";

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Model invoker credential.
    pub api_key: Option<String>,

    /// Chat-completions endpoint URL.
    pub model_endpoint: String,

    /// Per-call model invocation timeout (seconds).
    pub invoke_timeout_secs: u64,

    /// Root directory for stored message content.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            model_endpoint: DEFAULT_ENDPOINT.to_string(),
            invoke_timeout_secs: 20,
            data_dir: PathBuf::from("./data/messages"),
        }
    }
}

impl Config {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`. Blank values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.api_key = get(API_KEY_ENV);
        if let Some(endpoint) = get(ENDPOINT_ENV) {
            config.model_endpoint = endpoint;
        }
        if let Some(raw) = get(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.invoke_timeout_secs = secs,
                _ => warn!(
                    key = TIMEOUT_ENV,
                    value = %raw,
                    default = config.invoke_timeout_secs,
                    "Invalid timeout, using default"
                ),
            }
        }
        if let Some(dir) = get(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    /// Build the HTTP model invoker. Fails fast without a credential.
    pub fn build_invoker(&self) -> Result<OpenCodeInvoker, InvokeError> {
        OpenCodeInvoker::new(
            self.model_endpoint.clone(),
            self.api_key.clone().unwrap_or_default(),
            self.invoke_timeout(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config, Config::default());
        assert_eq!(config.invoke_timeout(), Duration::from_secs(20));
        assert_eq!(config.model_endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (API_KEY_ENV, "secret"),
            (ENDPOINT_ENV, "http://localhost:9000/v1/chat/completions"),
            (TIMEOUT_ENV, " 45 "),
            (DATA_DIR_ENV, "/var/lib/cnap"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.model_endpoint, "http://localhost:9000/v1/chat/completions");
        assert_eq!(config.invoke_timeout_secs, 45);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/cnap"));
    }

    #[test]
    fn test_invalid_timeout_falls_back() {
        for bad in ["soon", "0", "-3"] {
            let config = Config::from_lookup(lookup(&[(TIMEOUT_ENV, bad)]));
            assert_eq!(config.invoke_timeout_secs, 20);
        }
    }

    #[test]
    fn test_build_invoker_requires_key() {
        let err = Config::default().build_invoker().unwrap_err();
        assert!(matches!(err, InvokeError::MissingCredential(_)));

        let config = Config::from_lookup(lookup(&[(API_KEY_ENV, "   ")]));
        assert!(config.api_key.is_none());

        let config = Config::from_lookup(lookup(&[(API_KEY_ENV, "k")]));
        assert_eq!(config.build_invoker().unwrap().endpoint(), DEFAULT_ENDPOINT);
    }
}
