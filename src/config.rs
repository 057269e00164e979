use crate::provisioner::EngineDefaults;

/// Process configuration loaded from environment variables.
pub struct Config {
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Engine endpoint used by the API backend when the asset names none.
    pub container_host: Option<String>,
    /// Executable searched on `PATH` by the exec backend.
    pub executable: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("CONTAINER_HOST").ok().as_deref(),
            std::env::var("PODPROV_EXECUTABLE").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        container_host: Option<&str>,
        executable: Option<&str>,
    ) -> Self {
        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(String::from);

        Config {
            sentry_dsn: non_empty(sentry_dsn),
            environment: non_empty(environment).unwrap_or_else(|| "local".to_string()),
            container_host: non_empty(container_host),
            executable: non_empty(executable).unwrap_or_else(|| "podman".to_string()),
        }
    }

    pub fn engine_defaults(&self) -> EngineDefaults {
        EngineDefaults {
            container_host: self.container_host.clone(),
            executable_name: self.executable.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        let config = Config::from_raw_values(Some(""), None, None, None);
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_config_present_sentry_dsn() {
        let config = Config::from_raw_values(Some("https://sentry.io/123"), None, None, None);
        assert_eq!(config.sentry_dsn.as_deref(), Some("https://sentry.io/123"));
    }

    #[test]
    fn test_config_default_environment() {
        let config = Config::from_raw_values(None, None, None, None);
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn test_config_custom_environment() {
        let config = Config::from_raw_values(None, Some("production"), None, None);
        assert_eq!(config.environment, "production");
    }

    #[test]
    fn test_config_default_executable() {
        let config = Config::from_raw_values(None, None, None, Some(""));
        assert_eq!(config.executable, "podman");
        assert_eq!(config.engine_defaults().executable_name, "podman");
    }

    #[test]
    fn test_config_container_host_flows_to_engine_defaults() {
        let config = Config::from_raw_values(None, None, Some("tcp://10.0.0.5:8888"), Some("podman-remote"));
        let defaults = config.engine_defaults();
        assert_eq!(defaults.container_host.as_deref(), Some("tcp://10.0.0.5:8888"));
        assert_eq!(defaults.executable_name, "podman-remote");
    }
}
