use std::{
    path::{Path, PathBuf},
    sync::{LazyLock, OnceLock},
    time::Duration,
};

use figment::providers::Format;
use serde::{Deserialize, Serialize};

static CONFIG_FILE: OnceLock<PathBuf> = OnceLock::new();

/// Point [`CONFIG`] at a config file before its first access. Returns
/// false when the configuration was already loaded or a path was already
/// set.
pub fn set_config_file(path: impl Into<PathBuf>) -> bool {
    CONFIG_FILE.set(path.into()).is_ok()
}

/// Process-wide configuration.
///
/// Values are assembled from serialized defaults, an optional TOML file
/// ([`set_config_file`] or `GITRELAY_CONFIG_FILE`) and `GITRELAY__`-prefixed
/// environment variables split on `__`. `${VAR}` references in the config
/// file are expanded from the environment before parsing.
pub static CONFIG: LazyLock<DynAppConfig> = LazyLock::new(|| {
    let file = CONFIG_FILE
        .get()
        .cloned()
        .or_else(|| std::env::var("GITRELAY_CONFIG_FILE").ok().map(PathBuf::from));
    match DynAppConfig::load(file.as_deref()) {
        Ok(c) => c,
        Err(e) => panic!("Failed to extract gitrelay config: {e}"),
    }
});

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct DynAppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub oauth: OAuthRedirectConfig,
    pub publisher: PublisherConfig,
    /// Strict rule evaluation: a missing payload path fails the match and
    /// emits a diagnostic instead of resolving to null.
    pub rules_strict: bool,
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_ip: std::net::IpAddr,
    pub public_base_url: Option<url::Url>,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub read_header_timeout_ms: u64,
    pub max_body_bytes: usize,
    /// Log every published envelope at info level.
    pub debug_events: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            public_base_url: None,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            read_header_timeout_ms: 10_000,
            max_body_bytes: 2 * 1024 * 1024,
            debug_events: false,
        }
    }
}

impl ServerConfig {
    /// Request deadline applied by the HTTP timeout layer. The read and
    /// write phases are not separable under a single tower layer, so the
    /// deadline covers both.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms + self.write_timeout_ms)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum StorageDriver {
    Postgres,
    Memory,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum SqlDialect {
    Postgres,
    Mysql,
}

#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    pub dsn: String,
    pub dialect: SqlDialect,
    pub auto_migrate: bool,
    pub pool_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Postgres,
            dsn: String::new(),
            dialect: SqlDialect::Postgres,
            auto_migrate: false,
            pool_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct AuthConfig {
    pub oauth2: OAuth2Config,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct OAuth2Config {
    pub enabled: bool,
    pub issuer: Option<url::Url>,
    pub audience: Option<String>,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct OAuthRedirectConfig {
    /// Base URL the OAuth callback redirects to after upserting the
    /// installation row.
    pub redirect_base_url: Option<url::Url>,
}

#[derive(Clone, Deserialize, Serialize, Debug, Default, PartialEq)]
pub struct PublisherConfig {
    /// Driver names used when a publish call does not target specific
    /// drivers and the rule carries no usable driver config.
    pub default_drivers: Vec<String>,
}

impl DynAppConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment.
    ///
    /// # Errors
    /// Fails when the file cannot be read or a value cannot be deserialized.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = figment::providers::Serialized::defaults(Self::default());
        let mut config = figment::Figment::from(defaults);

        if let Some(path) = file {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!(e).context(format!("reading {}", path.display())))?;
            let expanded = expand_env(&raw);
            config = config.merge(figment::providers::Toml::string(&expanded));
        }

        #[cfg(not(test))]
        let prefix = "GITRELAY__";
        #[cfg(test)]
        let prefix = "GITRELAY_TEST__";
        config = config.merge(figment::providers::Env::prefixed(prefix).split("__"));

        Ok(config.extract::<Self>()?)
    }
}

/// Replace `${VAR}` references with the value of the environment variable.
/// Unset variables expand to the empty string.
fn expand_env(raw: &str) -> String {
    lazy_regex::regex!(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .replace_all(raw, |caps: &lazy_regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_extract() {
        figment::Jail::expect_with(|_jail| {
            let config = DynAppConfig::load(None).expect("defaults must parse");
            assert_eq!(config.server.port, 8080);
            assert_eq!(config.server.max_body_bytes, 2 * 1024 * 1024);
            assert!(!config.rules_strict);
            Ok(())
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("GITRELAY_TEST__SERVER__PORT", "9999");
            jail.set_env("GITRELAY_TEST__RULES_STRICT", "true");
            jail.set_env("GITRELAY_TEST__STORAGE__DIALECT", "mysql");
            let config = DynAppConfig::load(None).expect("env overrides must parse");
            assert_eq!(config.server.port, 9999);
            assert!(config.rules_strict);
            assert_eq!(config.storage.dialect, SqlDialect::Mysql);
            Ok(())
        });
    }

    #[test]
    fn config_file_with_env_expansion() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("GITRELAY_DSN_FOR_TEST", "postgres://localhost/relay");
            let dir = jail.directory().to_path_buf();
            let path = dir.join("gitrelay.toml");
            std::fs::write(
                &path,
                "[storage]\ndsn = \"${GITRELAY_DSN_FOR_TEST}\"\nauto_migrate = true\n",
            )
            .expect("write config file");
            let config = DynAppConfig::load(Some(&path)).expect("file must parse");
            assert_eq!(config.storage.dsn, "postgres://localhost/relay");
            assert!(config.storage.auto_migrate);
            Ok(())
        });
    }

    #[test]
    fn unset_vars_expand_empty() {
        assert_eq!(expand_env("a ${GITRELAY_DEFINITELY_UNSET_VAR} b"), "a  b");
    }
}
