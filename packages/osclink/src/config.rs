use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [ssh]
//                    port = 2222
//
//   env var:         OSCLINK_SSH__PORT=2222   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub local: LocalFileConfig,
    #[serde(default)]
    pub ssh: SshFileConfig,
    #[serde(default)]
    pub log: LogFileConfig,
}

/// PTY passthrough tunables (lives under `[local]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalFileConfig {
    /// Shell to spawn. Falls back to `$SHELL`, then the login shell.
    #[serde(default)]
    pub shell: Option<String>,
    /// Size used when the real terminal size cannot be read.
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LocalFileConfig {
    fn default() -> Self {
        Self {
            shell: None,
            rows: default_rows(),
            cols: default_cols(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// SSH tunables (lives under `[ssh]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SshFileConfig {
    #[serde(default = "default_ssh_host")]
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Path probed over SFTP before the collector is launched.
    #[serde(default = "default_remote_binary")]
    pub remote_binary: String,
    /// Command executed on the exec channel.
    #[serde(default = "default_remote_command")]
    pub remote_command: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Private keys tried in order. Empty means the usual `~/.ssh/id_*` files.
    #[serde(default)]
    pub identity_files: Vec<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SshFileConfig {
    fn default() -> Self {
        Self {
            host: default_ssh_host(),
            user: None,
            port: default_ssh_port(),
            remote_binary: default_remote_binary(),
            remote_command: default_remote_command(),
            connect_timeout_secs: default_connect_timeout_secs(),
            identity_files: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Logging tunables (lives under `[log]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogFileConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filter: default_log_filter(),
        }
    }
}

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_ssh_host() -> String {
    "localhost".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_remote_binary() -> String {
    "osclink/build/server".to_string()
}
fn default_remote_command() -> String {
    "sudo osclink/build/server".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_log_filter() -> String {
    "info".to_string()
}

/// `~/.config/osclink/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("osclink").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → OSCLINK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `OSCLINK_SSH__PORT=2222`  →  `ssh.port = 2222`
///   `OSCLINK_LOG__FILTER=debug`  →  `log.filter = "debug"`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("OSCLINK_").split("__"))
}

/// Load the configuration from `config_file`, or the default location.
///
/// A missing file is not an error; defaults and env vars still apply.
pub fn load(config_file: Option<&Path>) -> anyhow::Result<FileConfig> {
    let path = match config_file {
        Some(path) => path.to_path_buf(),
        None => default_config_path().unwrap_or_else(|| PathBuf::from("osclink.toml")),
    };
    let fc = load_config(&path).extract()?;
    Ok(fc)
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Local PTY transport configuration (runtime view).
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Program run on the PTY. `None` resolves the user's shell at start.
    pub shell: Option<String>,
    pub args: Vec<String>,
    pub rows: u16,
    pub cols: u16,
    pub poll_interval: Duration,
    /// When false: no raw mode, no stdin forwarding, passthrough discarded.
    pub interactive: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self::from_file(&LocalFileConfig::default())
    }
}

impl LocalConfig {
    pub fn from_file(fc: &LocalFileConfig) -> Self {
        Self {
            shell: fc.shell.clone(),
            args: Vec::new(),
            rows: fc.rows,
            cols: fc.cols,
            poll_interval: Duration::from_millis(fc.poll_interval_ms.max(1)),
            interactive: true,
        }
    }
}

/// SSH transport configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SshSettings {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub remote_binary: String,
    pub remote_command: String,
    pub connect_timeout: Duration,
    pub identity_files: Vec<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self::from_file(&SshFileConfig::default())
    }
}

impl SshSettings {
    pub fn from_file(fc: &SshFileConfig) -> Self {
        let user = fc
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default();
        let identity_files = if fc.identity_files.is_empty() {
            default_identity_files()
        } else {
            fc.identity_files.clone()
        };
        Self {
            host: fc.host.clone(),
            user,
            port: fc.port,
            remote_binary: fc.remote_binary.clone(),
            remote_command: fc.remote_command.clone(),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
            identity_files,
            poll_interval: Duration::from_millis(fc.poll_interval_ms.max(1)),
        }
    }
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

/// Directory for log files when `[log] dir` is unset.
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("osclink")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_local_file_config_defaults() {
        let d = LocalFileConfig::default();
        assert!(d.shell.is_none());
        assert_eq!((d.rows, d.cols), (24, 80));
        assert_eq!(d.poll_interval_ms, 100);
    }

    #[test]
    fn test_ssh_file_config_defaults() {
        let d = SshFileConfig::default();
        assert_eq!(d.host, "localhost");
        assert_eq!(d.port, 22);
        assert_eq!(d.remote_binary, "osclink/build/server");
        assert_eq!(d.remote_command, "sudo osclink/build/server");
        assert_eq!(d.connect_timeout_secs, 30);
        assert!(d.identity_files.is_empty());
    }

    // ── runtime views ───────────────────────────────────────────────────

    #[test]
    fn test_local_config_from_file() {
        let fc = LocalFileConfig {
            shell: Some("/bin/zsh".into()),
            poll_interval_ms: 0,
            ..Default::default()
        };
        let lc = LocalConfig::from_file(&fc);
        assert_eq!(lc.shell.as_deref(), Some("/bin/zsh"));
        assert!(lc.interactive);
        assert!(lc.args.is_empty());
        // A zero interval would turn the reader into a busy loop.
        assert_eq!(lc.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_ssh_settings_explicit_identities() {
        let fc = SshFileConfig {
            user: Some("alice".into()),
            identity_files: vec![PathBuf::from("/keys/id_test")],
            connect_timeout_secs: 5,
            ..Default::default()
        };
        let s = SshSettings::from_file(&fc);
        assert_eq!(s.user, "alice");
        assert_eq!(s.identity_files, vec![PathBuf::from("/keys/id_test")]);
        assert_eq!(s.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_ssh_settings_default_identities() {
        let s = SshSettings::from_file(&SshFileConfig::default());
        for path in &s.identity_files {
            assert!(path.to_string_lossy().contains(".ssh"));
        }
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(&tmp.path().join("config.toml"))
            .extract()
            .unwrap();
        assert_eq!(fc.ssh.port, 22);
        assert_eq!(fc.log.filter, "info");
    }

    #[test]
    fn test_load_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[ssh]\nhost = \"collector.lan\"\nport = 2222\n\n[local]\nshell = \"/bin/bash\"\n",
        )
        .unwrap();
        let fc = load(Some(&path)).unwrap();
        assert_eq!(fc.ssh.host, "collector.lan");
        assert_eq!(fc.ssh.port, 2222);
        assert_eq!(fc.ssh.remote_binary, "osclink/build/server");
        assert_eq!(fc.local.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(fc.local.rows, 24);
    }

    #[test]
    fn test_load_config_rejects_bad_types() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[ssh]\nport = \"not a port\"\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
