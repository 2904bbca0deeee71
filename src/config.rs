use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{Result, VeilError};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const DEFAULT_FORWARD_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub const KNOWN_SOURCES: &[&str] = &[
    "proxyscrape",
    "freeproxylist",
    "geonode",
    "proxylistorg",
    "github",
];

/// Application configuration.
///
/// Loaded from an optional TOML file, overridden by `VEIL_`-prefixed
/// environment variables (`VEIL_<SECTION>__<KEY>`). Durations are integer
/// seconds.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub checker: CheckerConfig,
    pub scraper: ScraperConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address; a bare `:port` binds all interfaces
    pub listen_addr: String,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub max_connections: usize,
    pub enable_https: bool,
    pub max_retries: u32,
    /// Request headers removed before forwarding
    pub strip_headers: Vec<String>,
    /// Request headers set (replacing) before forwarding
    pub add_headers: HashMap<String, String>,
    /// Bearer token required on every endpoint except /health; empty disables auth
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_string(),
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 60,
            max_connections: 1000,
            enable_https: true,
            max_retries: 3,
            strip_headers: vec![
                "X-Forwarded-For".to_string(),
                "X-Real-IP".to_string(),
                "X-Original-IP".to_string(),
                "CF-Connecting-IP".to_string(),
                "True-Client-IP".to_string(),
            ],
            add_headers: HashMap::from([(
                "User-Agent".to_string(),
                DEFAULT_FORWARD_USER_AGENT.to_string(),
            )]),
            auth_token: String::new(),
        }
    }
}

impl ServerConfig {
    /// Normalized bind address (`:8080` becomes `0.0.0.0:8080`)
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Enforced as the per-request header-read deadline on the listener.
    /// `write_timeout` and `idle_timeout` are accepted but not enforced;
    /// the HTTP/1 connection builder exposes no write or idle deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub update_interval: u64,
    pub max_failures: u32,
    pub recheck_time: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            update_interval: 15 * 60,
            max_failures: 3,
            recheck_time: 5 * 60,
        }
    }
}

impl ProxyConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub test_url: String,
    pub timeout: u64,
    pub max_workers: usize,
    pub user_agent: String,
    pub check_interval: u64,
    pub batch_size: usize,
    pub batch_delay: u64,
    pub background_enabled: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            test_url: "http://icanhazip.com".to_string(),
            timeout: 15,
            max_workers: 50,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            check_interval: 10 * 60,
            batch_size: 50,
            batch_delay: 30,
            background_enabled: true,
        }
    }
}

impl CheckerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub timeout: u64,
    pub user_agent: String,
    pub sources: Vec<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            sources: vec![
                "proxyscrape".to_string(),
                "freeproxylist".to_string(),
                "geonode".to_string(),
            ],
        }
    }
}

impl ScraperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_age: u64,
    pub cleanup_interval: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/veil.db".to_string(),
            max_age: 24 * 60 * 60,
            cleanup_interval: 60 * 60,
        }
    }
}

impl DatabaseConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age)
    }
}

impl Config {
    /// Load configuration: defaults <- optional file <- environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match config_path {
            Some(path) => {
                builder = builder.add_source(config::File::with_name(path));
            }
            None => {
                if Path::new("veil.toml").exists() {
                    builder = builder.add_source(config::File::with_name("veil"));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VEIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("scraper.sources")
                .with_list_parse_key("server.strip_headers"),
        );

        let config: Config = builder
            .build()
            .map_err(|e| VeilError::InvalidConfig(e.to_string()))?
            .try_deserialize()
            .map_err(|e| VeilError::InvalidConfig(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate ranges; fatal at startup
    pub fn validate(&self) -> Result<()> {
        let bind = self.server.bind_addr();
        bind.parse::<std::net::SocketAddr>().map_err(|_| {
            VeilError::InvalidConfig(format!("server.listen_addr is not bindable: {bind}"))
        })?;

        if !(1..=10).contains(&self.server.max_retries) {
            return Err(VeilError::InvalidConfig(
                "server.max_retries must be between 1 and 10".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(VeilError::InvalidConfig(
                "server.max_connections must be at least 1".into(),
            ));
        }

        if self.proxy.update_interval < 60 {
            return Err(VeilError::InvalidConfig(
                "proxy.update_interval must be at least 60 seconds".into(),
            ));
        }

        Url::parse(&self.checker.test_url)
            .map_err(|e| VeilError::InvalidConfig(format!("checker.test_url: {e}")))?;
        if !(1..=200).contains(&self.checker.max_workers) {
            return Err(VeilError::InvalidConfig(
                "checker.max_workers must be between 1 and 200".into(),
            ));
        }
        if !(1..=500).contains(&self.checker.batch_size) {
            return Err(VeilError::InvalidConfig(
                "checker.batch_size must be between 1 and 500".into(),
            ));
        }
        if self.checker.timeout == 0 {
            return Err(VeilError::InvalidConfig(
                "checker.timeout must be at least 1 second".into(),
            ));
        }

        for source in &self.scraper.sources {
            if !KNOWN_SOURCES.contains(&source.as_str()) {
                return Err(VeilError::InvalidConfig(format!(
                    "scraper.sources contains unknown source: {source}"
                )));
            }
        }

        if self.database.path.is_empty() {
            return Err(VeilError::InvalidConfig("database.path is empty".into()));
        }
        if self.database.max_age < 60 * 60 {
            return Err(VeilError::InvalidConfig(
                "database.max_age must be at least one hour".into(),
            ));
        }

        Ok(())
    }

    /// Default configuration file, written by `--gen-config`
    pub fn template() -> &'static str {
        r#"# Veil configuration. Environment variables override file values:
# VEIL_<SECTION>__<KEY>, e.g. VEIL_SERVER__LISTEN_ADDR=":3128".
# Durations are integer seconds.

[server]
listen_addr = ":8080"
read_timeout = 30
write_timeout = 30
idle_timeout = 60
max_connections = 1000
enable_https = true
max_retries = 3
strip_headers = [
    "X-Forwarded-For",
    "X-Real-IP",
    "X-Original-IP",
    "CF-Connecting-IP",
    "True-Client-IP",
]
auth_token = ""

[server.add_headers]
User-Agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"

[proxy]
update_interval = 900
max_failures = 3
recheck_time = 300

[checker]
test_url = "http://icanhazip.com"
timeout = 15
max_workers = 50
user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
check_interval = 600
batch_size = 50
batch_delay = 30
background_enabled = true

[scraper]
timeout = 30
user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36"
sources = ["proxyscrape", "freeproxylist", "geonode"]

[database]
path = "./data/veil.db"
max_age = 86400
cleanup_interval = 3600
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "VEIL_SERVER__LISTEN_ADDR",
        "VEIL_SERVER__MAX_RETRIES",
        "VEIL_SERVER__AUTH_TOKEN",
        "VEIL_PROXY__UPDATE_INTERVAL",
        "VEIL_CHECKER__TEST_URL",
        "VEIL_CHECKER__BATCH_SIZE",
        "VEIL_SCRAPER__SOURCES",
        "VEIL_DATABASE__PATH",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::load(None).unwrap();

        assert_eq!(config.server.listen_addr, ":8080");
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.server.max_retries, 3);
        assert_eq!(config.server.strip_headers.len(), 5);
        assert!(config.server.auth_token.is_empty());

        assert_eq!(config.proxy.update_interval(), Duration::from_secs(900));

        assert_eq!(config.checker.test_url, "http://icanhazip.com");
        assert_eq!(config.checker.batch_size, 50);
        assert_eq!(config.checker.batch_delay(), Duration::from_secs(30));
        assert!(config.checker.background_enabled);

        assert_eq!(
            config.scraper.sources,
            vec!["proxyscrape", "freeproxylist", "geonode"]
        );

        assert_eq!(config.database.path, "./data/veil.db");
        assert_eq!(config.database.max_age(), Duration::from_secs(86400));
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("VEIL_SERVER__LISTEN_ADDR", "127.0.0.1:3128");
        env::set_var("VEIL_SERVER__AUTH_TOKEN", "sekrit");
        env::set_var("VEIL_PROXY__UPDATE_INTERVAL", "3600");
        env::set_var("VEIL_SCRAPER__SOURCES", "github,geonode");

        let config = Config::load(None).unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:3128");
        assert_eq!(config.server.bind_addr(), "127.0.0.1:3128");
        assert_eq!(config.server.auth_token, "sekrit");
        assert_eq!(config.proxy.update_interval, 3600);
        assert_eq!(config.scraper.sources, vec!["github", "geonode"]);
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("VEIL_SERVER__LISTEN_ADDR", "not-an-addr");
        let err = Config::load(None).unwrap_err();
        assert!(matches!(err, VeilError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("VEIL_SCRAPER__SOURCES", "proxyscrape,darkweb");
        let err = Config::load(None).unwrap_err();
        assert!(matches!(err, VeilError::InvalidConfig(_)));
    }

    #[test]
    fn test_retry_range_validated() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("VEIL_SERVER__MAX_RETRIES", "0");
        let err = Config::load(None).unwrap_err();
        assert!(matches!(err, VeilError::InvalidConfig(_)));
    }

    #[test]
    fn test_template_parses_to_defaults() {
        let parsed: Config = toml::from_str(Config::template()).unwrap();
        assert_eq!(parsed.server.listen_addr, ":8080");
        assert_eq!(parsed.checker.batch_size, 50);
        assert_eq!(parsed.database.max_age, 86400);
        parsed.validate().unwrap();
    }
}
