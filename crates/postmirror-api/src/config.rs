use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use postmirror_core::config::{
    optional_trimmed, parse_value, required_trimmed, value_or_default, ConfigError,
};
use postmirror_core::util::is_http_url;
use postmirror_core::{RemoteConfig, RuntimeConfig};

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub source_api_url: String,
    pub source_api_token: Option<String>,
    /// Local file (or `:memory:`) used when no remote mirror is configured
    pub mirror_database_path: String,
    pub mirror_remote: Option<RemoteConfig>,
    /// Serve reads from the mirror; when false the source is the only origin
    pub mirror_enabled: bool,
    pub sync_api_secret: Option<String>,
    pub sync_webhook_secret: Option<String>,
    /// `None` disables the scheduler
    pub sync_interval: Option<Duration>,
    pub runtime: RuntimeConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("source_api_url", &self.source_api_url)
            .field("source_api_token", &redacted(self.source_api_token.as_ref()))
            .field("mirror_database_path", &self.mirror_database_path)
            .field("mirror_remote", &self.mirror_remote)
            .field("mirror_enabled", &self.mirror_enabled)
            .field("sync_api_secret", &redacted(self.sync_api_secret.as_ref()))
            .field(
                "sync_webhook_secret",
                &redacted(self.sync_webhook_secret.as_ref()),
            )
            .field("sync_interval", &self.sync_interval)
            .field("runtime", &self.runtime)
            .finish()
    }
}

fn redacted(value: Option<&String>) -> Option<&'static str> {
    value.map(|_| "[REDACTED]")
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "POSTMIRROR_BIND_ADDR", "127.0.0.1:8080");

        let source_api_url = required_trimmed(&lookup, "SOURCE_API_URL")?;
        if !is_http_url(&source_api_url) {
            return Err(ConfigError::Invalid(
                "SOURCE_API_URL must start with http:// or https://".to_string(),
            ));
        }
        let source_api_token = optional_trimmed(&lookup, "SOURCE_API_TOKEN");

        let mirror_database_path =
            value_or_default(&lookup, "MIRROR_DATABASE_PATH", "postmirror.db");
        let mirror_remote = match optional_trimmed(&lookup, "MIRROR_DATABASE_URL") {
            Some(url) => {
                let token = required_trimmed(&lookup, "MIRROR_AUTH_TOKEN")?;
                Some(RemoteConfig::new(url, token))
            }
            None => None,
        };
        let mirror_enabled = parse_value(&lookup, "MIRROR_ENABLED", true)?;

        let sync_api_secret = optional_trimmed(&lookup, "SYNC_API_SECRET");
        let sync_webhook_secret = optional_trimmed(&lookup, "SYNC_WEBHOOK_SECRET");

        let interval_secs = value_or_default(&lookup, "SYNC_INTERVAL_SECS", "0")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SYNC_INTERVAL_SECS must be 0 or an integer in [60, 86400]".to_string(),
                )
            })?;
        if interval_secs != 0 && !(60..=86_400).contains(&interval_secs) {
            return Err(ConfigError::Invalid(
                "SYNC_INTERVAL_SECS must be 0 or in [60, 86400]".to_string(),
            ));
        }
        let sync_interval = (interval_secs > 0).then(|| Duration::from_secs(interval_secs));

        let mut runtime = RuntimeConfig::from_lookup(&lookup)?;
        if interval_secs > 0 {
            runtime.sync_interval_secs = interval_secs;
        }

        Ok(Self {
            bind_addr,
            source_api_url,
            source_api_token,
            mirror_database_path,
            mirror_remote,
            mirror_enabled,
            sync_api_secret,
            sync_webhook_secret,
            sync_interval,
            runtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use postmirror_core::ResolutionStrategy;
    use pretty_assertions::assert_eq;

    use super::*;

    fn load(pairs: &[(&'static str, &'static str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_source_url() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("SOURCE_API_URL"));

        let err = load(&[("SOURCE_API_URL", "ftp://source")]).unwrap_err();
        assert!(err.to_string().contains("http://"));
    }

    #[test]
    fn config_defaults() {
        let config = load(&[("SOURCE_API_URL", "https://source.example")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.mirror_database_path, "postmirror.db");
        assert!(config.mirror_enabled);
        assert!(config.mirror_remote.is_none());
        assert_eq!(config.sync_interval, None);
        assert_eq!(config.runtime, RuntimeConfig::default());
    }

    #[test]
    fn config_reads_runtime_knobs_and_interval() {
        let config = load(&[
            ("SOURCE_API_URL", "https://source.example"),
            ("SYNC_INTERVAL_SECS", "600"),
            ("SYNC_BATCH_SIZE", "25"),
            ("SYNC_CONFLICT_RESOLUTION", "merge"),
            ("MIRROR_ENABLED", "false"),
        ])
        .unwrap();
        assert_eq!(config.sync_interval, Some(Duration::from_secs(600)));
        assert_eq!(config.runtime.sync_interval_secs, 600);
        assert_eq!(config.runtime.batch_size, 25);
        assert_eq!(
            config.runtime.conflict_resolution,
            ResolutionStrategy::Merge
        );
        assert!(!config.mirror_enabled);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let err = load(&[
            ("SOURCE_API_URL", "https://source.example"),
            ("SYNC_INTERVAL_SECS", "5"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SYNC_INTERVAL_SECS"));

        let err = load(&[
            ("SOURCE_API_URL", "https://source.example"),
            ("SYNC_BATCH_SIZE", "500"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SYNC_BATCH_SIZE"));
    }

    #[test]
    fn remote_mirror_needs_token() {
        let err = load(&[
            ("SOURCE_API_URL", "https://source.example"),
            ("MIRROR_DATABASE_URL", "libsql://mirror.turso.io"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("MIRROR_AUTH_TOKEN"));
    }

    #[test]
    fn config_redacts_secrets_in_debug() {
        let config = load(&[
            ("SOURCE_API_URL", "https://source.example"),
            ("SOURCE_API_TOKEN", "sensitive-source-token"),
            ("SYNC_API_SECRET", "sensitive-api-secret"),
            ("SYNC_WEBHOOK_SECRET", "sensitive-webhook-secret"),
            ("MIRROR_DATABASE_URL", "libsql://mirror.turso.io"),
            ("MIRROR_AUTH_TOKEN", "sensitive-mirror-token"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
