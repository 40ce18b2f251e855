//! Configuration file loading and worker command-line assembly.
//!
//! The config lives at `~/.lantern/config.toml` unless `LANTERN_CONFIG`
//! points elsewhere. A missing file means defaults; a malformed one is an
//! error. Every field has a default except the worker class path, which is
//! only required once a worker is actually launched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LanternError, Result};
use crate::supervisor::{ProbeSettings, WorkerSpec};

pub const CONFIG_ENV: &str = "LANTERN_CONFIG";
const LANTERN_DIR_NAME: &str = ".lantern";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEBUG_PORT_TOKEN: &str = "###";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanternConfig {
    pub bus: BusConfig,
    pub worker: WorkerConfig,
    pub model_server: Option<ModelServerConfig>,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus name handed to workers with `-m`.
    pub name: String,
    /// Unix socket of an external bus hub. The CLI refuses to talk to
    /// workers without one; embedders may use a `LocalBus` instead.
    pub socket: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "lantern".to_string(),
            socket: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub java: String,
    /// Whitespace-separated JVM options. `###` is replaced by a random
    /// debug port.
    pub jvm_args: String,
    pub class_path: Option<String>,
    pub main_class: String,
    pub log_file: Option<PathBuf>,
    pub debug: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            java: "java".to_string(),
            jvm_args: String::new(),
            class_path: None,
            main_class: "edu.brown.cs.diad.diad.DiadMain".to_string(),
            log_file: None,
            debug: false,
        }
    }
}

/// The optional model-serving worker, started after the analysis worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelServerConfig {
    pub main_class: String,
    pub log_file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub use_host: Option<String>,
    pub alt_host: Option<String>,
    pub alt_port: Option<u16>,
    pub alt_use_host: Option<String>,
    pub model: Option<String>,
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            main_class: "edu.brown.cs.limba.limba.LimbaMain".to_string(),
            log_file: None,
            host: None,
            port: None,
            use_host: None,
            alt_host: None,
            alt_port: None,
            alt_use_host: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ping_ms: u64,
    pub command_ms: u64,
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    pub request_deadline_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ping_ms: 1_000,
            command_ms: 60_000,
            retry_delay_ms: 2_000,
            max_attempts: 500,
            request_deadline_ms: 300_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            max_attempts: self.max_attempts.max(1),
            ping_timeout: Duration::from_millis(self.ping_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl LanternConfig {
    /// Command line for the analysis worker:
    /// `<java> [jvm args] -cp <classpath> <main> -m <bus> -L <log> [-D]`.
    pub fn primary_spec(&self) -> Result<WorkerSpec> {
        let worker = &self.worker;
        let log_file = match &worker.log_file {
            Some(path) => path.clone(),
            None => lantern_dir()?.join("diad.log"),
        };

        let mut args = self.java_prefix(&worker.main_class)?;
        args.extend(bus_and_log_args(&self.bus.name, &log_file));
        if worker.debug {
            args.push("-D".to_string());
        }

        Ok(WorkerSpec {
            name: "analysis".to_string(),
            ping_tag: lantern_protocol::COMMAND_TAG.to_string(),
            args,
        })
    }

    /// Command line for the model server, if one is configured.
    pub fn secondary_spec(&self) -> Result<Option<WorkerSpec>> {
        let Some(model) = &self.model_server else {
            return Ok(None);
        };
        let log_file = match &model.log_file {
            Some(path) => path.clone(),
            None => lantern_dir()?.join("limba.log"),
        };

        let mut args = self.java_prefix(&model.main_class)?;
        args.extend(bus_and_log_args(&self.bus.name, &log_file));

        let port = model.port.map(|port| port.to_string());
        let alt_port = model.alt_port.map(|port| port.to_string());
        let options = [
            ("-host", model.host.as_ref()),
            ("-port", port.as_ref()),
            ("-usehost", model.use_host.as_ref()),
            ("-althost", model.alt_host.as_ref()),
            ("-altport", alt_port.as_ref()),
            ("-altusehost", model.alt_use_host.as_ref()),
            ("-llama", model.model.as_ref()),
        ];
        for (flag, value) in options {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }

        Ok(Some(WorkerSpec {
            name: "model".to_string(),
            ping_tag: lantern_protocol::MODEL_TAG.to_string(),
            args,
        }))
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        self.timeouts.probe_settings()
    }

    fn java_prefix(&self, main_class: &str) -> Result<Vec<String>> {
        let class_path = self
            .worker
            .class_path
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| LanternError::ConfigIncomplete("worker.class_path is not set".into()))?;

        let mut args = vec![self.worker.java.clone()];
        args.extend(
            expand_debug_port(&self.worker.jvm_args)
                .split_whitespace()
                .map(str::to_string),
        );
        args.push("-cp".to_string());
        args.push(class_path.to_string());
        args.push(main_class.to_string());
        Ok(args)
    }
}

fn bus_and_log_args(bus_name: &str, log_file: &Path) -> [String; 4] {
    [
        "-m".to_string(),
        bus_name.to_string(),
        "-L".to_string(),
        log_file.display().to_string(),
    ]
}

/// Replaces the `###` placeholder with a random port in 3000..4000.
pub fn expand_debug_port(jvm_args: &str) -> String {
    if !jvm_args.contains(DEBUG_PORT_TOKEN) {
        return jvm_args.to_string();
    }
    let port: u16 = rand::thread_rng().gen_range(3000..4000);
    info!(port, "Worker debug port");
    jvm_args.replace(DEBUG_PORT_TOKEN, &port.to_string())
}

/// `~/.lantern`
pub fn lantern_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(LanternError::HomeDirNotFound)?;
    Ok(home.join(LANTERN_DIR_NAME))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(lantern_dir()?.join("logs"))
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(lantern_dir()?.join(CONFIG_FILE_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<LanternConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(LanternConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| LanternError::Io {
        context: format!("reading {}", config_path.display()),
        source,
    })?;
    toml::from_str::<LanternConfig>(&content).map_err(|err| LanternError::ConfigMalformed {
        path: config_path.clone(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    fn configured() -> LanternConfig {
        let mut config = LanternConfig::default();
        config.worker.class_path = Some("/opt/diad/diad.jar".to_string());
        config.worker.log_file = Some(PathBuf::from("/tmp/diad.log"));
        config
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(dir.path().join("absent.toml"))).expect("defaults");
        assert_eq!(config, LanternConfig::default());
        assert_eq!(config.timeouts.max_attempts, 500);
        assert_eq!(config.bus.name, "lantern");
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[bus]
name = "bubbles_dev"

[worker]
class_path = "/opt/diad/diad.jar"
debug = true

[timeouts]
ping_ms = 250
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("parse");
        assert_eq!(config.bus.name, "bubbles_dev");
        assert!(config.worker.debug);
        assert_eq!(config.worker.java, "java");
        assert_eq!(config.timeouts.ping_ms, 250);
        assert_eq!(config.timeouts.command_ms, 60_000);
        assert!(config.model_server.is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timeouts]\nping_ms = \"soon\"\n").expect("write config");

        let err = load_config(Some(path)).expect_err("should fail");
        assert!(matches!(err, LanternError::ConfigMalformed { .. }));
    }

    #[test]
    fn env_override_selects_config_path() {
        let _lock = env_lock();
        let _guard = EnvGuard::set(CONFIG_ENV, "/etc/lantern/test.toml");
        assert_eq!(
            default_config_path().expect("path"),
            PathBuf::from("/etc/lantern/test.toml")
        );
    }

    #[test]
    fn primary_command_line_has_expected_shape() {
        let mut config = configured();
        config.worker.jvm_args = "-Xmx4g -ea".to_string();
        config.worker.debug = true;

        let spec = config.primary_spec().expect("spec");
        assert_eq!(spec.ping_tag, "DIAD");
        assert_eq!(
            spec.args,
            vec![
                "java",
                "-Xmx4g",
                "-ea",
                "-cp",
                "/opt/diad/diad.jar",
                "edu.brown.cs.diad.diad.DiadMain",
                "-m",
                "lantern",
                "-L",
                "/tmp/diad.log",
                "-D",
            ]
        );
    }

    #[test]
    fn class_path_is_required_to_launch() {
        let err = LanternConfig::default()
            .primary_spec()
            .expect_err("should fail");
        assert!(matches!(err, LanternError::ConfigIncomplete(_)));
    }

    #[test]
    fn debug_port_placeholder_is_replaced() {
        let expanded = expand_debug_port("-agentlib:jdwp=transport=dt_socket,address=###");
        let port: u16 = expanded
            .rsplit('=')
            .next()
            .and_then(|value| value.parse().ok())
            .expect("port");
        assert!((3000..4000).contains(&port));
        assert_eq!(expand_debug_port("-ea"), "-ea");
    }

    #[test]
    fn secondary_adds_model_server_options() {
        let mut config = configured();
        assert_eq!(config.secondary_spec().expect("spec"), None);

        config.model_server = Some(ModelServerConfig {
            log_file: Some(PathBuf::from("/tmp/limba.log")),
            host: Some("localhost".to_string()),
            port: Some(11434),
            model: Some("codellama".to_string()),
            ..ModelServerConfig::default()
        });

        let spec = config.secondary_spec().expect("spec").expect("configured");
        assert_eq!(spec.ping_tag, "LIMBA");
        let tail: Vec<&str> = spec.args.iter().rev().take(6).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-host", "localhost", "-port", "11434", "-llama", "codellama"]
        );
    }

    #[test]
    fn probe_settings_follow_timeouts() {
        let settings = configured().probe_settings();
        assert_eq!(settings, ProbeSettings::default());
    }
}
