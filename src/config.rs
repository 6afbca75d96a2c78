//! Project discovery and runtime settings
//!
//! The project name and suffix come from `portlens.json` (or `routes.json`),
//! falling back to the `package.json` name and finally the directory name.
//! The same file may carry `proxy`, `ports` and shutdown settings.

use crate::error::PortlensError;
use crate::upstream::RetryPolicy;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Config files checked in order; the first one that parses wins
pub const CONFIG_FILES: [&str; 2] = ["portlens.json", "routes.json"];

/// Package manifest used as the fallback naming source
pub const MANIFEST_FILE: &str = "package.json";

/// Suffix used when the config file does not set one
pub const DEFAULT_SUFFIX: &str = ".localhost";

/// Environment variable overriding the proxy's primary port
pub const PROXY_PORT_ENV: &str = "PORTLENS_PROXY_PORT";

/// Contents of `portlens.json` / `routes.json`
#[derive(Debug, Deserialize, Clone)]
pub struct ConfigFile {
    /// Project name (the part before the suffix)
    pub name: Option<String>,

    /// Domain suffix, e.g. ".localhost" or ".test"
    pub suffix: Option<String>,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Range scanned for the internal port
    #[serde(default)]
    pub ports: PortRange,

    /// Grace period in seconds between SIGTERM and SIGKILL for the wrapped command
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            name: None,
            suffix: None,
            proxy: ProxySettings::default(),
            ports: PortRange::default(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// Primary public port (default: 80, 0 lets the OS pick)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Ports tried in order when the primary port is busy or restricted
    #[serde(default = "default_fallback_ports")]
    pub fallback_ports: Vec<u16>,

    /// Address the proxy listens on (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: IpAddr,

    /// Connection retries while the upstream is still booting
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between connection retries in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Timeout for a single upstream connect attempt in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            fallback_ports: default_fallback_ports(),
            bind: default_bind_address(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl ProxySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Inclusive port range scanned by the port allocator
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    #[serde(default = "default_range_start")]
    pub start: u16,
    #[serde(default = "default_range_end")]
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: default_range_start(),
            end: default_range_end(),
        }
    }
}

fn default_proxy_port() -> u16 {
    80
}

fn default_fallback_ports() -> Vec<u16> {
    vec![8080, 8888, 0]
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_range_start() -> u16 {
    4000
}

fn default_range_end() -> u16 {
    4999
}

fn default_shutdown_grace_period() -> u64 {
    3
}

/// Read the proxy port override from the environment
pub fn proxy_port_from_env() -> Option<u16> {
    let value = std::env::var(PROXY_PORT_ENV).ok()?;
    match value.trim().parse() {
        Ok(port) => Some(port),
        Err(e) => {
            warn!(var = PROXY_PORT_ENV, value = %value, error = %e, "Ignoring invalid port override");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    name: Option<String>,
}

/// Resolved project identity and settings
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub suffix: String,
    pub proxy: ProxySettings,
    pub ports: PortRange,
    pub shutdown_grace_period_secs: u64,
}

impl ProjectConfig {
    /// Discover the project living in `dir`.
    ///
    /// Fails with [`PortlensError::NoProjectDetected`] when neither a config
    /// file nor a package manifest exists and no name override was given.
    pub async fn discover(dir: &Path, name_override: Option<&str>) -> Result<Self, PortlensError> {
        let mut found_project = false;
        let mut file = None;

        for candidate in CONFIG_FILES {
            let path = dir.join(candidate);
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            found_project = true;
            match serde_json::from_str::<ConfigFile>(&content) {
                Ok(parsed) => {
                    debug!(path = %path.display(), "Loaded project config");
                    file = Some(parsed);
                    break;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                }
            }
        }

        let file = file.unwrap_or_default();
        let mut name = file.name.clone().filter(|n| !n.trim().is_empty());

        if let Ok(content) = tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await {
            found_project = true;
            if name.is_none() {
                name = manifest_name(&content);
            }
        }

        if let Some(manual) = name_override {
            name = Some(manual.to_string());
        } else if !found_project {
            return Err(PortlensError::NoProjectDetected {
                dir: dir.to_path_buf(),
            });
        }

        let name = name
            .or_else(|| dir_name(dir))
            .unwrap_or_else(|| "app".to_string());

        Ok(Self {
            name,
            suffix: normalize_suffix(file.suffix.as_deref()),
            proxy: file.proxy,
            ports: file.ports,
            shutdown_grace_period_secs: file.shutdown_grace_period_secs,
        })
    }

    /// The fully qualified domain, e.g. `my-app.localhost`
    pub fn domain(&self) -> Result<String, PortlensError> {
        let label = sanitize_label(&self.name);
        if label.is_empty() {
            return Err(PortlensError::InvalidDomain {
                name: self.name.clone(),
            });
        }
        Ok(format!("{}{}", label, self.suffix))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Package name with any scope prefix (`@org/`) removed
fn manifest_name(content: &str) -> Option<String> {
    let manifest: PackageManifest = match serde_json::from_str(content) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed package.json");
            return None;
        }
    };
    manifest
        .name
        .as_deref()
        .and_then(|n| n.rsplit('/').next())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
}

fn dir_name(dir: &Path) -> Option<String> {
    let dir: PathBuf = if dir.is_relative() {
        std::env::current_dir().ok()?.join(dir)
    } else {
        dir.to_path_buf()
    };
    dir.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(String::from)
}

fn normalize_suffix(suffix: Option<&str>) -> String {
    let suffix = suffix
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUFFIX)
        .to_lowercase();
    if suffix.starts_with('.') {
        suffix
    } else {
        format!(".{}", suffix)
    }
}

/// Lowercase the name and replace anything outside `[a-z0-9.-]` with a dash
fn sanitize_label(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_dir(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_name_from_portlens_json() {
        let dir = project_dir(&[("portlens.json", r#"{"name": "custom-app"}"#)]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.name, "custom-app");
        assert_eq!(config.suffix, ".localhost");
        assert_eq!(config.domain().unwrap(), "custom-app.localhost");
    }

    #[tokio::test]
    async fn test_routes_json_and_suffix() {
        let dir = project_dir(&[("routes.json", r#"{"name": "shop", "suffix": "test"}"#)]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.domain().unwrap(), "shop.test");
    }

    #[tokio::test]
    async fn test_portlens_json_wins_over_routes_json() {
        let dir = project_dir(&[
            ("portlens.json", r#"{"name": "first"}"#),
            ("routes.json", r#"{"name": "second"}"#),
        ]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.name, "first");
    }

    #[tokio::test]
    async fn test_scoped_package_name_fallback() {
        let dir = project_dir(&[("package.json", r#"{"name": "@org/my-app", "version": "1.0.0"}"#)]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.name, "my-app");
        assert_eq!(config.domain().unwrap(), "my-app.localhost");
    }

    #[tokio::test]
    async fn test_config_without_name_uses_manifest() {
        let dir = project_dir(&[
            ("portlens.json", r#"{"suffix": ".demo"}"#),
            ("package.json", r#"{"name": "storefront"}"#),
        ]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.domain().unwrap(), "storefront.demo");
    }

    #[tokio::test]
    async fn test_malformed_config_falls_back_to_manifest() {
        let dir = project_dir(&[
            ("portlens.json", "{ not json"),
            ("package.json", r#"{"name": "fallback-app"}"#),
        ]);

        let config = ProjectConfig::discover(dir.path(), None).await.unwrap();
        assert_eq!(config.name, "fallback-app");
    }

    #[tokio::test]
    async fn test_nameless_manifest_uses_directory_name() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("blog-site");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("package.json"), r#"{"private": true}"#).unwrap();

        let config = ProjectConfig::discover(&dir, None).await.unwrap();
        assert_eq!(config.name, "blog-site");
    }

    #[tokio::test]
    async fn test_no_project_detected() {
        let dir = project_dir(&[]);

        let err = ProjectConfig::discover(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, PortlensError::NoProjectDetected { .. }));
        assert!(err.to_string().contains("No project detected"));
    }

    #[tokio::test]
    async fn test_name_override_without_project() {
        let dir = project_dir(&[]);

        let config = ProjectConfig::discover(dir.path(), Some("manual-test-app"))
            .await
            .unwrap();
        assert_eq!(config.domain().unwrap(), "manual-test-app.localhost");
        assert_eq!(config.proxy.port, 80);
    }

    #[tokio::test]
    async fn test_name_override_beats_config() {
        let dir = project_dir(&[("portlens.json", r#"{"name": "configured", "suffix": ".test"}"#)]);

        let config = ProjectConfig::discover(dir.path(), Some("override"))
            .await
            .unwrap();
        assert_eq!(config.domain().unwrap(), "override.test");
    }

    #[test]
    fn test_default_settings() {
        let file = ConfigFile::default();
        assert_eq!(file.proxy.port, 80);
        assert_eq!(file.proxy.fallback_ports, vec![8080, 8888, 0]);
        assert_eq!(file.proxy.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(file.proxy.retries, 5);
        assert_eq!(file.proxy.retry_policy().delay, Duration::from_millis(500));
        assert_eq!(file.proxy.connect_timeout(), Duration::from_secs(2));
        assert_eq!(file.ports, PortRange { start: 4000, end: 4999 });
        assert_eq!(file.shutdown_grace_period_secs, 3);
    }

    #[test]
    fn test_parse_settings_sections() {
        let json = r#"{
            "name": "api",
            "proxy": { "port": 0, "fallback_ports": [], "retries": 2, "retry_delay_ms": 50 },
            "ports": { "start": 5000 },
            "shutdown_grace_period_secs": 1
        }"#;

        let file: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.proxy.port, 0);
        assert!(file.proxy.fallback_ports.is_empty());
        assert_eq!(file.proxy.retries, 2);
        assert_eq!(file.proxy.connect_timeout_ms, 2000);
        assert_eq!(file.ports, PortRange { start: 5000, end: 4999 });
        assert_eq!(file.shutdown_grace_period_secs, 1);
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("My_App"), "my-app");
        assert_eq!(sanitize_label("  spaced name "), "spaced-name");
        assert_eq!(sanitize_label("@@@"), "");
    }

    #[test]
    fn test_invalid_domain() {
        let config = ProjectConfig {
            name: "___".to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
            proxy: ProxySettings::default(),
            ports: PortRange::default(),
            shutdown_grace_period_secs: 3,
        };
        assert!(matches!(
            config.domain(),
            Err(PortlensError::InvalidDomain { .. })
        ));
    }
}
