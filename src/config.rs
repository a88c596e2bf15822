/// Configuration for databases and their query caches.
///
/// All settings have working defaults; a config can be built in code with the
/// builder-style setters or deserialized from JSON. Durations are expressed
/// in milliseconds on the wire.
///
/// ```ignore
/// let config = DatabaseConfig::new("shop")
///     .multi_instance(true)
///     .cache(CacheConfig::default().try_to_keep_max(50));
/// ```
use crate::error::{ReactiveError, ReactiveResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Default number of cached queries the replacement policy tries to keep.
pub const DEFAULT_TRY_TO_KEEP_MAX: usize = 100;

/// Default lifetime of a cached query that was never evaluated.
pub const DEFAULT_UNEXECUTED_LIFETIME: Duration = Duration::from_millis(30_000);

/// Default debounce delay before the replacement policy runs.
pub const DEFAULT_CACHE_REPLACEMENT_WAIT: Duration = Duration::from_millis(20_000);

/// Default delay before a destroyed database closes its broadcast channel.
pub const DEFAULT_CHANNEL_CLOSE_GRACE: Duration = Duration::from_millis(1_000);

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Query cache settings, applied to every collection of a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Cache size at which the replacement policy starts evicting.
    pub try_to_keep_max: usize,
    /// Never-evaluated queries older than this are evicted first.
    #[serde(with = "duration_ms")]
    pub unexecuted_lifetime: Duration,
    /// Debounce delay between write activity and a replacement run.
    #[serde(with = "duration_ms")]
    pub replacement_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            try_to_keep_max: DEFAULT_TRY_TO_KEEP_MAX,
            unexecuted_lifetime: DEFAULT_UNEXECUTED_LIFETIME,
            replacement_wait: DEFAULT_CACHE_REPLACEMENT_WAIT,
        }
    }
}

impl CacheConfig {
    pub fn try_to_keep_max(mut self, max: usize) -> Self {
        self.try_to_keep_max = max;
        self
    }

    pub fn unexecuted_lifetime(mut self, lifetime: Duration) -> Self {
        self.unexecuted_lifetime = lifetime;
        self
    }

    pub fn replacement_wait(mut self, wait: Duration) -> Self {
        self.replacement_wait = wait;
        self
    }
}

/// Settings for one database instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database name. Also scopes the broadcast channel.
    pub name: String,
    /// Coordinate with other instances attached to the same storage.
    pub multi_instance: bool,
    /// Allow opening the same (name, adapter) pair more than once.
    pub ignore_duplicate: bool,
    /// Delay between destroy and closing the broadcast channel.
    #[serde(with = "duration_ms")]
    pub channel_close_grace: Duration,
    /// Query cache settings.
    pub cache: CacheConfig,
    /// Free-form options passed through to hooks.
    pub options: JsonValue,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            multi_instance: true,
            ignore_duplicate: false,
            channel_close_grace: DEFAULT_CHANNEL_CLOSE_GRACE,
            cache: CacheConfig::default(),
            options: JsonValue::Null,
        }
    }
}

impl DatabaseConfig {
    /// Create a config with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ReactiveResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn multi_instance(mut self, enabled: bool) -> Self {
        self.multi_instance = enabled;
        self
    }

    pub fn ignore_duplicate(mut self, enabled: bool) -> Self {
        self.ignore_duplicate = enabled;
        self
    }

    pub fn channel_close_grace(mut self, grace: Duration) -> Self {
        self.channel_close_grace = grace;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn options(mut self, options: JsonValue) -> Self {
        self.options = options;
        self
    }

    /// Check the config for values that cannot work.
    pub fn validate(&self) -> ReactiveResult<()> {
        if self.name.is_empty() {
            return Err(ReactiveError::InvalidConfig {
                reason: "database name must not be empty".to_string(),
            });
        }
        if self.name.contains(':') || self.name.contains('/') {
            return Err(ReactiveError::InvalidConfig {
                reason: format!("database name '{}' must not contain ':' or '/'", self.name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::new("shop");
        assert!(config.multi_instance);
        assert!(!config.ignore_duplicate);
        assert_eq!(config.channel_close_grace, Duration::from_millis(1000));
        assert_eq!(config.cache.try_to_keep_max, 100);
        assert_eq!(config.cache.unexecuted_lifetime, Duration::from_secs(30));
        assert_eq!(config.cache.replacement_wait, Duration::from_secs(20));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = DatabaseConfig::from_json_str(
            r#"{"name": "shop", "multiInstance": false, "cache": {"tryToKeepMax": 5, "replacementWait": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.name, "shop");
        assert!(!config.multi_instance);
        assert_eq!(config.cache.try_to_keep_max, 5);
        assert_eq!(config.cache.replacement_wait, Duration::from_millis(250));
        assert_eq!(config.cache.unexecuted_lifetime, DEFAULT_UNEXECUTED_LIFETIME);
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(DatabaseConfig::new("").validate().is_err());
        assert!(DatabaseConfig::new("a:b").validate().is_err());
        assert!(DatabaseConfig::from_json_str(r#"{"name": ""}"#).is_err());
        assert!(DatabaseConfig::new("ok").validate().is_ok());
    }
}
