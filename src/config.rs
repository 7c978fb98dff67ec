use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "cla-proxy";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Client-facing model name -> backend model name
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default)]
    pub params: ParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Model used when the client does not name one
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    /// Scheme ("http", "https", "all") -> proxy URL
    #[serde(default)]
    pub proxies: HashMap<String, String>,
}

/// Client certificate presented to the backend (PEM files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level", deserialize_with = "deserialize_level")]
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamsConfig {
    /// Generation parameters never forwarded to the backend
    #[serde(default)]
    pub drop: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_endpoint() -> String {
    "https://0.0.0.0:8080".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_model() -> String {
    "default".to_string()
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("/etc/pki/consumer/cert.pem")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("/etc/pki/consumer/key.pem")
}

fn default_level() -> String {
    "INFO".to_string()
}

const ALLOWED_LEVELS: &[&str] = &["CRITICAL", "ERROR", "WARNING", "INFO", "DEBUG", "NOTSET"];

fn deserialize_level<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    normalize_level(&raw).map_err(serde::de::Error::custom)
}

/// Upper-case a log level name and check it against the accepted set.
pub fn normalize_level(raw: &str) -> std::result::Result<String, String> {
    let level = raw.trim().to_uppercase();
    if ALLOWED_LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(format!(
            "The requested level '{}' is not allowed. Choose from: {}",
            level,
            ALLOWED_LEVELS.join(", ")
        ))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
            models: HashMap::new(),
            params: ParamsConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout: default_timeout(),
            model: default_model(),
            api_key_env: None,
            auth: None,
            proxies: HashMap::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config home > XDG config dirs > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::warn!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Directive for `tracing_subscriber::EnvFilter` derived from `[logging].level`.
    pub fn tracing_directive(&self) -> String {
        let level = match self.logging.level.as_str() {
            "CRITICAL" | "ERROR" => "error",
            "WARNING" => "warn",
            "DEBUG" => "debug",
            "NOTSET" => "trace",
            _ => "info",
        };
        format!("cla_proxy={level},tower_http={level}")
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.trim_end_matches('/'))
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.endpoint.trim_end_matches('/'))
    }

    /// Resolve the bearer token from the configured environment variable, if any.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        let Some(ref var) = self.api_key_env else {
            return Ok(None);
        };
        std::env::var(var).map(Some).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your backend API key.",
                var
            ))
        })
    }

    /// Build the shared HTTP client: connection pool, proxies and client certificate.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().pool_idle_timeout(Duration::from_secs(90));

        for (scheme, url) in &self.proxies {
            let proxy = match scheme.as_str() {
                "http" => reqwest::Proxy::http(url)?,
                "https" => reqwest::Proxy::https(url)?,
                "all" => reqwest::Proxy::all(url)?,
                other => {
                    return Err(ProxyError::config(format!(
                        "Unsupported proxy scheme '{}' (expected http, https or all)",
                        other
                    )))
                }
            };
            builder = builder.proxy(proxy);
        }

        if let Some(ref auth) = self.auth {
            let mut pem = std::fs::read(&auth.cert_file).map_err(|e| {
                ProxyError::config(format!(
                    "Failed to read certificate {}: {}",
                    auth.cert_file.display(),
                    e
                ))
            })?;
            let key = std::fs::read(&auth.key_file).map_err(|e| {
                ProxyError::config(format!(
                    "Failed to read key {}: {}",
                    auth.key_file.display(),
                    e
                ))
            })?;
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)?;
            builder = builder.use_rustls_tls().identity(identity);
        }

        Ok(builder.build()?)
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("{APP_DIR}.toml"))];

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            paths.push(PathBuf::from(xdg).join(APP_DIR).join(CONFIG_FILE));
        }
    }

    for dir in xdg_config_dirs() {
        paths.push(dir.join(APP_DIR).join(CONFIG_FILE));
    }

    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join(APP_DIR).join(CONFIG_FILE));
    }

    paths
}

/// Entries of `$XDG_CONFIG_DIRS`, or `/etc/xdg` when it is unset or empty.
fn xdg_config_dirs() -> Vec<PathBuf> {
    let raw = std::env::var("XDG_CONFIG_DIRS").unwrap_or_default();
    let dirs: Vec<PathBuf> = std::env::split_paths(&raw)
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    if dirs.is_empty() {
        vec![PathBuf::from("/etc/xdg")]
    } else {
        dirs
    }
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000

[backend]
endpoint = "https://inference.example.com/v1/"
timeout = 12
model = "granite"
api_key_env = "CLA_BACKEND_KEY"

[backend.proxies]
https = "http://proxy.example.com:3128"

[logging]
level = "debug"

[models]
"gpt-4o" = "granite-3-8b"

[params]
drop = ["logit_bias"]
"#
        )
        .unwrap();

        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.backend.timeout(), Duration::from_secs(12));
        assert_eq!(config.backend.model, "granite");
        assert_eq!(config.logging.level, "DEBUG");
        assert_eq!(
            config.backend.chat_completions_url(),
            "https://inference.example.com/v1/chat/completions"
        );
        assert_eq!(
            config.models.get("gpt-4o"),
            Some(&"granite-3-8b".to_string())
        );
        assert_eq!(config.params.drop, vec!["logit_bias".to_string()]);
        assert!(config.backend.auth.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.backend.endpoint, "https://0.0.0.0:8080");
        assert_eq!(config.backend.timeout, 30);
        assert_eq!(config.logging.level, "INFO");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[logging]\nlevel = \"verbose\"").unwrap();
        let err = ProxyConfig::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn test_auth_section_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[backend.auth]").unwrap();
        let config = ProxyConfig::load(f.path()).unwrap();
        let auth = config.backend.auth.unwrap();
        assert_eq!(auth.cert_file, PathBuf::from("/etc/pki/consumer/cert.pem"));
        assert_eq!(auth.key_file, PathBuf::from("/etc/pki/consumer/key.pem"));
    }

    #[test]
    fn test_tracing_directive() {
        let mut config = ProxyConfig::default();
        assert_eq!(config.tracing_directive(), "cla_proxy=info,tower_http=info");
        config.logging.level = "WARNING".to_string();
        assert_eq!(config.tracing_directive(), "cla_proxy=warn,tower_http=warn");
    }

    #[test]
    fn test_unsupported_proxy_scheme() {
        let mut backend = BackendConfig::default();
        backend
            .proxies
            .insert("socks".to_string(), "socks5://127.0.0.1:1080".to_string());
        assert!(matches!(
            backend.build_client(),
            Err(ProxyError::Config { .. })
        ));
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let backend = BackendConfig {
            auth: Some(AuthConfig {
                cert_file: PathBuf::from("/nonexistent/cert.pem"),
                key_file: PathBuf::from("/nonexistent/key.pem"),
            }),
            ..BackendConfig::default()
        };
        assert!(matches!(
            backend.build_client(),
            Err(ProxyError::Config { .. })
        ));
    }

    #[test]
    fn test_no_api_key_env_means_no_key() {
        let backend = BackendConfig::default();
        assert_eq!(backend.resolve_api_key().unwrap(), None);
    }

    #[test]
    fn test_unreadable_config_is_config_error() {
        let err = ProxyConfig::load(Path::new("/nonexistent/cla-proxy.toml")).unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
        assert!(err.to_string().contains("/nonexistent/cla-proxy.toml"));
        assert_eq!(err.error_type(), "server_error");
    }
}
