//! cloudscale.toml parser and environment overlay.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};

const DEFAULT_BACKEND_FILE: &str = "./nginx/backend_servers.conf";
const DEFAULT_LB_CONTAINER: &str = "nginx-lb";
const DEFAULT_APP_PORT: u16 = 5000;

// ── File layer ─────────────────────────────────────────────────

/// Raw contents of `cloudscale.toml`. Every field is optional; the
/// environment and built-in defaults fill the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub target: TargetFile,
    pub app: AppFile,
    pub load_balancer: LoadBalancerFile,
    pub policy: PolicyFile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetFile {
    pub project: Option<String>,
    pub zone: Option<String>,
    pub instance: Option<String>,
    pub machine_type: Option<String>,
    pub image_family: Option<String>,
    pub image_project: Option<String>,
    pub network: Option<String>,
    pub subnet: Option<String>,
    pub tags: Option<Vec<String>>,
    pub boot_disk_size_gb: Option<u32>,
    pub boot_disk_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppFile {
    pub registry_namespace: Option<String>,
    pub image: Option<String>,
    pub tag: Option<String>,
    pub port: Option<u16>,
    pub env: Option<BTreeMap<String, String>>,
    pub firewall_rule: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadBalancerFile {
    pub backend_file: Option<PathBuf>,
    pub container: Option<String>,
    pub fallback_backend: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyFile {
    pub threshold: Option<f64>,
    pub poll_interval: Option<String>,
    pub sample_window: Option<String>,
    pub scale_up_cooldown: Option<String>,
    pub scale_down_cooldown: Option<String>,
    pub operation_timeout: Option<String>,
    pub operation_poll_interval: Option<String>,
    pub ready_timeout: Option<String>,
    pub ready_poll_interval: Option<String>,
    pub cleanup_on_start: Option<bool>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

// ── Resolved configuration ─────────────────────────────────────

/// Fully resolved controller configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub target: TargetConfig,
    pub app: AppConfig,
    pub load_balancer: LoadBalancerConfig,
    pub policy: PolicyConfig,
}

/// The single managed instance and how to create it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub network: String,
    pub subnet: String,
    pub tags: Vec<String>,
    pub boot_disk_size_gb: u32,
    pub boot_disk_type: String,
}

impl TargetConfig {
    /// Boot image reference resolved through the image family.
    pub fn source_image(&self) -> String {
        format!(
            "projects/{}/global/images/family/{}",
            self.image_project, self.image_family
        )
    }
}

/// The containerized application deployed onto the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub registry_namespace: String,
    pub image: String,
    pub tag: String,
    pub port: u16,
    /// Environment variables injected into the container.
    pub env: BTreeMap<String, String>,
    /// Name of the firewall rule opening `port`.
    pub firewall_rule: String,
}

impl AppConfig {
    /// Full image reference, e.g. `alice/flask-app:latest`.
    pub fn image_ref(&self) -> String {
        format!("{}/{}:{}", self.registry_namespace, self.image, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub backend_file: PathBuf,
    pub container: String,
    /// Backend written back after the managed instance is deleted.
    pub fallback_backend: Option<FallbackBackend>,
}

/// An `address:port` pair used as the load balancer's backend when no
/// managed instance exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackBackend {
    pub address: String,
    pub port: u16,
}

impl FromStr for FallbackBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| "expected address:port".to_string())?;
        if address.is_empty() {
            return Err("empty address".to_string());
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port: {e}"))?;
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

/// Scaling policy and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    /// Overload threshold in percent, applied to both CPU and memory.
    pub threshold: f64,
    pub poll_interval: Duration,
    /// Window over which CPU usage is measured for a single sample.
    pub sample_window: Duration,
    /// Minimum time after a scale-down before the next scale-up.
    pub scale_up_cooldown: Duration,
    /// Minimum time after a scale-up before the next scale-down.
    pub scale_down_cooldown: Duration,
    pub operation_timeout: Duration,
    pub operation_poll_interval: Duration,
    /// How long to wait for the instance to accept remote commands.
    pub ready_timeout: Duration,
    /// Pause between SSH reachability probes.
    pub ready_poll_interval: Duration,
    /// Delete a pre-existing managed instance before the loop starts.
    pub cleanup_on_start: bool,
}

impl ControllerConfig {
    /// Load `.env`, the optional config file, and the process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match dotenvy::dotenv() {
            Ok(p) => debug!(path = ?p, "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => warn!(error = %e, "failed to load .env"),
        }

        let file = match path {
            Some(p) => ConfigFile::from_file(p)?,
            None => ConfigFile::default(),
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup.
    pub fn resolve<F>(file: ConfigFile, env: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let layer = Layer { env: &env };
        let ConfigFile {
            target: t,
            app: a,
            load_balancer: lb,
            policy: p,
        } = file;

        let target = TargetConfig {
            project: layer.required("PROJECT_ID", t.project)?,
            zone: layer.required("ZONE", t.zone)?,
            instance: layer.required("VM_NAME", t.instance)?,
            machine_type: layer.or("MACHINE_TYPE", t.machine_type, "e2-medium"),
            image_family: layer.or("IMAGE_FAMILY", t.image_family, "debian-12"),
            image_project: layer.or("IMAGE_PROJECT", t.image_project, "debian-cloud"),
            network: layer.or("CLOUDSCALE_NETWORK", t.network, "default"),
            subnet: layer.or("CLOUDSCALE_SUBNET", t.subnet, "default"),
            tags: match layer.env("CLOUDSCALE_TAGS") {
                Some(v) => split_list(&v),
                None => t
                    .tags
                    .unwrap_or_else(|| vec!["http-server".into(), "https-server".into()]),
            },
            boot_disk_size_gb: layer
                .parsed("CLOUDSCALE_BOOT_DISK_SIZE_GB", t.boot_disk_size_gb)?
                .unwrap_or(10),
            boot_disk_type: layer.or("CLOUDSCALE_BOOT_DISK_TYPE", t.boot_disk_type, "pd-standard"),
        };

        let port = layer
            .parsed("CLOUDSCALE_APP_PORT", a.port)?
            .unwrap_or(DEFAULT_APP_PORT);
        let mut app_env = a
            .env
            .unwrap_or_else(|| BTreeMap::from([("APP_NAME".to_string(), "GCP_VM".to_string())]));
        if let Some(name) = layer.env("CLOUDSCALE_APP_NAME") {
            app_env.insert("APP_NAME".to_string(), name);
        }
        let app = AppConfig {
            registry_namespace: layer.required("DOCKER_USERNAME", a.registry_namespace)?,
            image: layer.or("CLOUDSCALE_IMAGE", a.image, "flask-app"),
            tag: layer.or("CLOUDSCALE_IMAGE_TAG", a.tag, "latest"),
            port,
            env: app_env,
            firewall_rule: layer
                .string("CLOUDSCALE_FIREWALL_RULE", a.firewall_rule)
                .unwrap_or_else(|| format!("allow-port-{port}")),
        };

        let fallback_backend = match layer.string("CLOUDSCALE_FALLBACK_BACKEND", lb.fallback_backend) {
            Some(raw) => Some(raw.parse::<FallbackBackend>().map_err(|reason| {
                ConfigError::Invalid {
                    key: "CLOUDSCALE_FALLBACK_BACKEND",
                    value: raw.clone(),
                    reason,
                }
            })?),
            None => None,
        };
        let load_balancer = LoadBalancerConfig {
            backend_file: layer
                .env("CLOUDSCALE_BACKEND_FILE")
                .map(PathBuf::from)
                .or(lb.backend_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKEND_FILE)),
            container: layer.or("CLOUDSCALE_LB_CONTAINER", lb.container, DEFAULT_LB_CONTAINER),
            fallback_backend,
        };

        let policy = PolicyConfig {
            threshold: layer
                .parsed("CLOUDSCALE_THRESHOLD", p.threshold)?
                .ok_or(ConfigError::Missing("CLOUDSCALE_THRESHOLD"))?,
            poll_interval: layer.duration("CLOUDSCALE_POLL_INTERVAL", p.poll_interval, 5)?,
            sample_window: layer.duration("CLOUDSCALE_SAMPLE_WINDOW", p.sample_window, 1)?,
            scale_up_cooldown: layer.duration(
                "CLOUDSCALE_SCALE_UP_COOLDOWN",
                p.scale_up_cooldown,
                30,
            )?,
            scale_down_cooldown: layer.duration(
                "CLOUDSCALE_SCALE_DOWN_COOLDOWN",
                p.scale_down_cooldown,
                120,
            )?,
            operation_timeout: layer.duration(
                "CLOUDSCALE_OPERATION_TIMEOUT",
                p.operation_timeout,
                300,
            )?,
            operation_poll_interval: layer.duration(
                "CLOUDSCALE_OPERATION_POLL_INTERVAL",
                p.operation_poll_interval,
                2,
            )?,
            ready_timeout: layer.duration("CLOUDSCALE_READY_TIMEOUT", p.ready_timeout, 180)?,
            ready_poll_interval: layer.duration(
                "CLOUDSCALE_READY_POLL_INTERVAL",
                p.ready_poll_interval,
                5,
            )?,
            cleanup_on_start: layer.flag("CLOUDSCALE_CLEANUP_ON_START", p.cleanup_on_start, true)?,
        };

        let config = Self {
            target,
            app,
            load_balancer,
            policy,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the type system does not capture.
    pub fn validate(&self) -> ConfigResult<()> {
        let threshold = self.policy.threshold;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
            return Err(ConfigError::Invalid {
                key: "CLOUDSCALE_THRESHOLD",
                value: threshold.to_string(),
                reason: "must be a percentage in (0, 100]".to_string(),
            });
        }
        if self.app.port == 0 {
            return Err(ConfigError::Invalid {
                key: "CLOUDSCALE_APP_PORT",
                value: "0".to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }
        for (key, value) in [
            ("CLOUDSCALE_POLL_INTERVAL", self.policy.poll_interval),
            (
                "CLOUDSCALE_OPERATION_POLL_INTERVAL",
                self.policy.operation_poll_interval,
            ),
            (
                "CLOUDSCALE_READY_POLL_INTERVAL",
                self.policy.ready_poll_interval,
            ),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0s".to_string(),
                    reason: "interval must be non-zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Environment-over-file lookup helpers.
struct Layer<'a, F> {
    env: &'a F,
}

impl<F> Layer<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn env(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, file: Option<String>) -> Option<String> {
        self.env(key).or(file)
    }

    fn or(&self, key: &str, file: Option<String>, default: &str) -> String {
        self.string(key, file)
            .unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &'static str, file: Option<String>) -> ConfigResult<String> {
        self.string(key, file).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, file: Option<T>) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.env(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(file),
        }
    }

    fn duration(
        &self,
        key: &'static str,
        file: Option<String>,
        default_secs: u64,
    ) -> ConfigResult<Duration> {
        match self.string(key, file) {
            Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(Duration::from_secs(default_secs)),
        }
    }

    fn flag(&self, key: &'static str, file: Option<bool>, default: bool) -> ConfigResult<bool> {
        let Some(raw) = self.env(key) else {
            return Ok(file.unwrap_or(default));
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("PROJECT_ID", "demo-project"),
            ("ZONE", "us-central1-a"),
            ("VM_NAME", "overflow-vm"),
            ("DOCKER_USERNAME", "alice"),
            ("CLOUDSCALE_THRESHOLD", "75"),
        ])
    }

    fn resolve_env(env: &HashMap<&'static str, &'static str>) -> ConfigResult<ControllerConfig> {
        ControllerConfig::resolve(ConfigFile::default(), |k| {
            env.get(k).map(|v| v.to_string())
        })
    }

    #[test]
    fn defaults_fill_optional_settings() {
        let config = resolve_env(&base_env()).unwrap();

        assert_eq!(config.target.machine_type, "e2-medium");
        assert_eq!(config.target.tags, vec!["http-server", "https-server"]);
        assert_eq!(config.target.boot_disk_size_gb, 10);
        assert_eq!(config.app.port, 5000);
        assert_eq!(config.app.firewall_rule, "allow-port-5000");
        assert_eq!(config.app.env.get("APP_NAME").map(String::as_str), Some("GCP_VM"));
        assert_eq!(config.app.image_ref(), "alice/flask-app:latest");
        assert_eq!(
            config.load_balancer.backend_file,
            PathBuf::from("./nginx/backend_servers.conf")
        );
        assert_eq!(config.load_balancer.container, "nginx-lb");
        assert!(config.load_balancer.fallback_backend.is_none());
        assert_eq!(config.policy.poll_interval, Duration::from_secs(5));
        assert_eq!(config.policy.scale_down_cooldown, Duration::from_secs(120));
        assert_eq!(config.policy.operation_poll_interval, Duration::from_secs(2));
        assert_eq!(config.policy.ready_poll_interval, Duration::from_secs(5));
        assert!(config.policy.cleanup_on_start);
    }

    #[test]
    fn ready_poll_interval_is_separate_and_non_zero() {
        let mut env = base_env();
        env.insert("CLOUDSCALE_READY_POLL_INTERVAL", "15s");
        let config = resolve_env(&env).unwrap();
        assert_eq!(config.policy.ready_poll_interval, Duration::from_secs(15));
        assert_eq!(config.policy.operation_poll_interval, Duration::from_secs(2));

        env.insert("CLOUDSCALE_READY_POLL_INTERVAL", "0s");
        let err = resolve_env(&env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "CLOUDSCALE_READY_POLL_INTERVAL", .. }
        ));
    }

    #[test]
    fn threshold_is_required() {
        let mut env = base_env();
        env.remove("CLOUDSCALE_THRESHOLD");

        let err = resolve_env(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CLOUDSCALE_THRESHOLD")));
    }

    #[test]
    fn missing_project_is_reported_by_env_name() {
        let mut env = base_env();
        env.remove("PROJECT_ID");

        let err = resolve_env(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PROJECT_ID")));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut env = base_env();
        env.insert("CLOUDSCALE_THRESHOLD", "150");

        let err = resolve_env(&env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "CLOUDSCALE_THRESHOLD", .. }
        ));
    }

    #[test]
    fn invalid_duration_rejected() {
        let mut env = base_env();
        env.insert("CLOUDSCALE_POLL_INTERVAL", "soon");

        let err = resolve_env(&env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "CLOUDSCALE_POLL_INTERVAL", .. }
        ));
    }

    #[test]
    fn env_overrides_file() {
        let file = ConfigFile::parse(
            r#"
[target]
project = "file-project"
zone = "europe-west1-b"
instance = "file-vm"
tags = ["web"]

[app]
registry_namespace = "bob"
port = 8080

[policy]
threshold = 40.0
scale_down_cooldown = "10m"
"#,
        )
        .unwrap();

        let env = HashMap::from([("ZONE", "us-east1-c"), ("CLOUDSCALE_THRESHOLD", "90")]);
        let config =
            ControllerConfig::resolve(file, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.target.project, "file-project");
        assert_eq!(config.target.zone, "us-east1-c");
        assert_eq!(config.target.tags, vec!["web"]);
        assert_eq!(config.app.port, 8080);
        assert_eq!(config.app.firewall_rule, "allow-port-8080");
        assert_eq!(config.policy.threshold, 90.0);
        assert_eq!(config.policy.scale_down_cooldown, Duration::from_secs(600));
    }

    #[test]
    fn unknown_file_keys_rejected() {
        let err = ConfigFile::parse("[policy]\nthreshhold = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn fallback_backend_parsed() {
        let mut env = base_env();
        env.insert("CLOUDSCALE_FALLBACK_BACKEND", "host.docker.internal:5000");

        let config = resolve_env(&env).unwrap();
        assert_eq!(
            config.load_balancer.fallback_backend,
            Some(FallbackBackend {
                address: "host.docker.internal".to_string(),
                port: 5000,
            })
        );

        env.insert("CLOUDSCALE_FALLBACK_BACKEND", "no-port");
        assert!(resolve_env(&env).is_err());
    }

    #[test]
    fn flags_and_tag_lists() {
        let mut env = base_env();
        env.insert("CLOUDSCALE_CLEANUP_ON_START", "no");
        env.insert("CLOUDSCALE_TAGS", "a, b,,c");

        let config = resolve_env(&env).unwrap();
        assert!(!config.policy.cleanup_on_start);
        assert_eq!(config.target.tags, vec!["a", "b", "c"]);

        env.insert("CLOUDSCALE_CLEANUP_ON_START", "maybe");
        assert!(resolve_env(&env).is_err());
    }

    #[test]
    fn source_image_uses_family() {
        let config = resolve_env(&base_env()).unwrap();
        assert_eq!(
            config.target.source_image(),
            "projects/debian-cloud/global/images/family/debian-12"
        );
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudscale.toml");
        std::fs::write(&path, "[load_balancer]\ncontainer = \"haproxy\"\n").unwrap();

        let file = ConfigFile::from_file(&path).unwrap();
        assert_eq!(file.load_balancer.container.as_deref(), Some("haproxy"));

        let missing = ConfigFile::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
