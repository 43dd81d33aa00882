use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Tunables (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    port = 9001
//
//   env var:         DEVAGENT_SERVER__PORT=9001   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub runtime: RuntimeFileConfig,
    #[serde(default)]
    pub projects: ProjectsFileConfig,
    #[serde(default)]
    pub tail: TailFileConfig,
    #[serde(default)]
    pub discovery: DiscoveryFileConfig,
}

/// `[server]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 = let the OS pick
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

/// `[runtime]` - how the shell-out collaborators are invoked.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeFileConfig {
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_tmux_bin")]
    pub tmux_bin: String,
    #[serde(default = "default_git_bin")]
    pub git_bin: String,
    /// User for `docker exec` when the container does not declare one
    #[serde(default = "default_exec_user")]
    pub exec_user: String,
    /// Compose file looked up relative to the project path
    #[serde(default = "default_compose_file")]
    pub compose_file: String,
}

impl Default for RuntimeFileConfig {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            tmux_bin: default_tmux_bin(),
            git_bin: default_git_bin(),
            exec_user: default_exec_user(),
            compose_file: default_compose_file(),
        }
    }
}

/// `[projects]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectsFileConfig {
    /// Directories whose immediate git-repository children are projects
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

/// `[tail]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TailFileConfig {
    #[serde(default = "default_tail_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_tail_lines")]
    pub lines: u32,
}

impl Default for TailFileConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_tail_interval_ms(),
            lines: default_tail_lines(),
        }
    }
}

/// `[discovery]`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryFileConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Upper bound on any single Control API request made by the CLI.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for DiscoveryFileConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_docker_bin() -> String {
    "docker".to_string()
}
fn default_tmux_bin() -> String {
    "tmux".to_string()
}
fn default_git_bin() -> String {
    "git".to_string()
}
fn default_exec_user() -> String {
    "root".to_string()
}
fn default_compose_file() -> String {
    ".devcontainer/docker-compose.yml".to_string()
}
fn default_tail_interval_ms() -> u64 {
    500
}
fn default_tail_lines() -> u32 {
    20
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Build a figment that layers: defaults → config.toml → DEVAGENT_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("DEVAGENT_").split("__"))
}

// =============================================================================
// Runtime views (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TailConfig {
    pub interval: Duration,
    pub lines: u32,
}

impl TailConfig {
    pub fn from_file(fc: &TailFileConfig) -> Self {
        Self {
            // a zero interval would spin
            interval: Duration::from_millis(fc.interval_ms.max(50)),
            lines: fc.lines,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn from_file(fc: &DiscoveryFileConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(fc.probe_timeout_ms),
            request_timeout: Duration::from_millis(fc.request_timeout_ms.max(100)),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from_file(&DiscoveryFileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment; derived from --config-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DevagentConfig {
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl DevagentConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".devagent"),
        };

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        let logs_dir = config_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", logs_dir))?;

        let state_dir = config_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        debug!("Config directory: {}", config_dir.display());

        Ok(Self {
            config_dir,
            logs_dir,
        })
    }

    /// Directory holding the lock and registration files.
    pub fn state_dir(&self) -> PathBuf {
        self.config_dir.join("state")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.config_dir)
            .extract()
            .with_context(|| format!("Invalid config in {}", self.config_toml_path().display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 0);
        assert_eq!(fc.runtime.docker_bin, "docker");
        assert_eq!(fc.runtime.tmux_bin, "tmux");
        assert!(fc.projects.roots.is_empty());
        assert_eq!(fc.tail.lines, 20);
        assert_eq!(fc.discovery.probe_timeout_ms, 2000);
    }

    #[test]
    fn test_tail_config_clamps_interval() {
        let tc = TailConfig::from_file(&TailFileConfig {
            interval_ms: 0,
            lines: 5,
        });
        assert_eq!(tc.interval, Duration::from_millis(50));
        assert_eq!(tc.lines, 5);
    }

    #[test]
    fn test_discovery_config_default_is_two_seconds() {
        assert_eq!(DiscoveryConfig::default().probe_timeout, Duration::from_secs(2));
        assert_eq!(DiscoveryConfig::default().request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_devagent_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DevagentConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.config_dir, tmp.path());
        assert_eq!(config.logs_dir, tmp.path().join("logs"));
        assert_eq!(config.state_dir(), tmp.path().join("state"));
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
        assert!(tmp.path().join("logs").exists());
        assert!(tmp.path().join("state").exists());
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.tail.interval_ms, 500);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nport = 9001\n\n[runtime]\nexec_user = \"vscode\"\n\n[projects]\nroots = [\"/src\"]\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 9001);
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.runtime.exec_user, "vscode");
        assert_eq!(fc.projects.roots, vec![PathBuf::from("/src")]);
    }
}
