//! Client configuration, built explicitly or read from the EPICS environment.

use std::{env, fmt, str::FromStr, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    client::{NotificationSink, TracingSink},
    dbr::ValueAccessMode,
};

/// When enum option names carried by control-level responses are taken
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EnumNamePolicy {
    /// Names from the first response that carries any are kept for good
    #[default]
    FirstResponseOnly,
    RefreshOnEveryControlResponse,
}

impl FromStr for EnumNamePolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(EnumNamePolicy::FirstResponseOnly),
            "always" | "refresh" => Ok(EnumNamePolicy::RefreshOnEveryControlResponse),
            other => Err(format!("Unknown enum name policy '{other}'")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {variable}: {message}")]
    InvalidValue {
        variable: &'static str,
        message: String,
    },
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ClientConfig {
    /// Used by every operation not given an explicit timeout
    pub timeout: Duration,
    /// Access mode of channels created without one
    pub default_access_mode: ValueAccessMode,
    pub enum_name_policy: EnumNamePolicy,
    /// Subscribe to every enum field at control level, even with names known
    pub always_request_enum_names: bool,
    /// Writes with a larger payload are refused locally
    pub max_array_bytes: Option<usize>,
    pub notification_capacity: usize,
    pub sink: Arc<dyn NotificationSink>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: DEFAULT_TIMEOUT,
            default_access_mode: ValueAccessMode::default(),
            enum_name_policy: EnumNamePolicy::default(),
            always_request_enum_names: false,
            max_array_bytes: None,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            sink: Arc::new(TracingSink),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("timeout", &self.timeout)
            .field("default_access_mode", &self.default_access_mode)
            .field("enum_name_policy", &self.enum_name_policy)
            .field("always_request_enum_names", &self.always_request_enum_names)
            .field("max_array_bytes", &self.max_array_bytes)
            .field("notification_capacity", &self.notification_capacity)
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    /// Read configuration from the process environment
    ///
    /// - `EPICS_CA_CONN_TMO`: operation timeout in seconds (default 30, minimum 0.1)
    /// - `EPICS_CA_MAX_ARRAY_BYTES`: largest write payload accepted
    /// - `EPICARS_ACCESS_MODE`: one of `value`, `status`, `time`, `control`
    /// - `EPICARS_ENUM_NAMES`: `first` or `always`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ClientConfig::default();
        // Like the other EPICS tools, an unusable timeout is ignored
        config.timeout = lookup("EPICS_CA_CONN_TMO")
            .and_then(|v| v.trim().parse::<f32>().ok())
            .and_then(|secs| Duration::try_from_secs_f32(secs.max(0.1f32)).ok())
            .unwrap_or(DEFAULT_TIMEOUT);

        if let Some(bytes) = lookup("EPICS_CA_MAX_ARRAY_BYTES") {
            config.max_array_bytes =
                Some(bytes.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    variable: "EPICS_CA_MAX_ARRAY_BYTES",
                    message: format!("{e}"),
                })?);
        }
        if let Some(mode) = lookup("EPICARS_ACCESS_MODE") {
            config.default_access_mode =
                mode.parse().map_err(|message| ConfigError::InvalidValue {
                    variable: "EPICARS_ACCESS_MODE",
                    message,
                })?;
        }
        if let Some(policy) = lookup("EPICARS_ENUM_NAMES") {
            config.enum_name_policy =
                policy
                    .parse()
                    .map_err(|message| ConfigError::InvalidValue {
                        variable: "EPICARS_ENUM_NAMES",
                        message,
                    })?;
        }
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn with_access_mode(mut self, mode: ValueAccessMode) -> Self {
        self.default_access_mode = mode;
        self
    }
    pub fn with_enum_name_policy(mut self, policy: EnumNamePolicy) -> Self {
        self.enum_name_policy = policy;
        self
    }
    pub fn with_always_request_enum_names(mut self, always: bool) -> Self {
        self.always_request_enum_names = always;
        self
    }
    pub fn with_max_array_bytes(mut self, bytes: Option<usize>) -> Self {
        self.max_array_bytes = bytes;
        self
    }
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.default_access_mode, ValueAccessMode::ValueOnly);
        assert_eq!(config.enum_name_policy, EnumNamePolicy::FirstResponseOnly);
        assert_eq!(config.max_array_bytes, None);
    }

    #[test]
    fn environment_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("EPICS_CA_CONN_TMO", "0.01"),
            ("EPICS_CA_MAX_ARRAY_BYTES", "16384"),
            ("EPICARS_ACCESS_MODE", "CTRL"),
            ("EPICARS_ENUM_NAMES", "always"),
        ]))
        .unwrap();
        // Clamped to the minimum
        assert_eq!(config.timeout, Duration::from_secs_f32(0.1));
        assert_eq!(config.max_array_bytes, Some(16384));
        assert_eq!(config.default_access_mode, ValueAccessMode::WithControl);
        assert_eq!(
            config.enum_name_policy,
            EnumNamePolicy::RefreshOnEveryControlResponse
        );

        let config = ClientConfig::from_lookup(lookup(&[("EPICS_CA_CONN_TMO", "soon")])).unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        for unrepresentable in ["inf", "1e30"] {
            let config =
                ClientConfig::from_lookup(lookup(&[("EPICS_CA_CONN_TMO", unrepresentable)]))
                    .unwrap();
            assert_eq!(config.timeout, DEFAULT_TIMEOUT, "{unrepresentable}");
        }
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("EPICARS_ACCESS_MODE", "everything")])),
            Err(ConfigError::InvalidValue {
                variable: "EPICARS_ACCESS_MODE",
                ..
            })
        ));
        assert!(ClientConfig::from_lookup(lookup(&[("EPICS_CA_MAX_ARRAY_BYTES", "-1")])).is_err());
    }
}
