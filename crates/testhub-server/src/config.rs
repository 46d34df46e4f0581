use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Args;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub socket_path: PathBuf,
    pub control_socket_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub pid_file: PathBuf,
    pub outbound_queue: usize,
    /// `None` keeps idle connections open forever.
    pub inactivity_timeout: Option<Duration>,
    pub rpc_timeout: Duration,
    pub services: ServicesConfig,
}

/// Unix sockets of the collaborating services. Unset entries are disabled.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    pub probe_socket: Option<PathBuf>,
    pub agent_socket: Option<PathBuf>,
    pub monitor_socket: Option<PathBuf>,
    pub stats_socket: Option<PathBuf>,
    pub users_socket: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    control_socket_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    outbound_queue: Option<usize>,
    inactivity_timeout_secs: Option<u64>,
    rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    services: ServicesConfig,
}

/// Merge command line flags over the config file over built-in defaults.
///
/// Without `--config` the per-user config file is read when it exists.
pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config_path {
        Some(path) => read_file_config(path)?,
        None => match user_config_file().filter(|path| path.exists()) {
            Some(path) => read_file_config(&path)?,
            None => FileConfig::default(),
        },
    };

    let runtime_dir = file_cfg
        .runtime_dir
        .unwrap_or_else(default_runtime_dir);
    let socket_path = args
        .socket_path
        .clone()
        .or(file_cfg.socket_path)
        .unwrap_or_else(|| runtime_dir.join("testhub.sock"));
    let control_socket_path = args
        .control_socket_path
        .clone()
        .or(file_cfg.control_socket_path)
        .unwrap_or_else(|| runtime_dir.join("testhub-control.sock"));
    let pid_file = file_cfg
        .pid_file
        .unwrap_or_else(|| runtime_dir.join("testhub.pid"));

    Ok(RuntimeConfig {
        socket_path,
        control_socket_path,
        runtime_dir,
        pid_file,
        outbound_queue: file_cfg.outbound_queue.unwrap_or(1024).max(1),
        inactivity_timeout: file_cfg
            .inactivity_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        rpc_timeout: Duration::from_millis(file_cfg.rpc_timeout_ms.unwrap_or(5000)),
        services: file_cfg.services,
    })
}

/// Sockets and the pid file live here unless configured otherwise.
fn default_runtime_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("testhub"),
        None => {
            // SAFETY: getuid has no preconditions.
            let uid = unsafe { libc::getuid() };
            std::env::temp_dir().join(format!("testhub-{uid}"))
        }
    }
}

/// `testhub/testhub.toml` under the user's config home, if one is known.
fn user_config_file() -> Option<PathBuf> {
    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(config_home.join("testhub").join("testhub.toml"))
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_config(path: &Path) -> Args {
        Args {
            config_path: Some(path.to_path_buf()),
            ..Args::default()
        }
    }

    #[test]
    fn defaults_derive_from_runtime_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("testhub.toml");
        let runtime = dir.path().join("run");
        fs::write(
            &cfg_path,
            format!("runtime_dir = {:?}\n", runtime.display().to_string()),
        )
        .expect("write config");

        let cfg = load_runtime_config(&args_with_config(&cfg_path)).expect("load");
        assert_eq!(cfg.socket_path, runtime.join("testhub.sock"));
        assert_eq!(cfg.control_socket_path, runtime.join("testhub-control.sock"));
        assert_eq!(cfg.pid_file, runtime.join("testhub.pid"));
        assert_eq!(cfg.outbound_queue, 1024);
        assert_eq!(cfg.inactivity_timeout, None);
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(5));
        assert_eq!(cfg.services, ServicesConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("testhub.toml");
        fs::write(
            &cfg_path,
            r#"
socket_path = "/tmp/from-file.sock"
outbound_queue = 8
inactivity_timeout_secs = 30
rpc_timeout_ms = 250

[services]
probe_socket = "/tmp/probe.sock"
users_socket = "/tmp/users.sock"
"#,
        )
        .expect("write config");

        let args = Args {
            socket_path: Some(PathBuf::from("/tmp/from-flag.sock")),
            ..args_with_config(&cfg_path)
        };
        let cfg = load_runtime_config(&args).expect("load");
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/from-flag.sock"));
        assert_eq!(cfg.outbound_queue, 8);
        assert_eq!(cfg.inactivity_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.rpc_timeout, Duration::from_millis(250));
        assert_eq!(
            cfg.services.probe_socket,
            Some(PathBuf::from("/tmp/probe.sock"))
        );
        assert_eq!(cfg.services.agent_socket, None);
    }

    #[test]
    fn zero_inactivity_timeout_disables_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("testhub.toml");
        fs::write(&cfg_path, "inactivity_timeout_secs = 0\n").expect("write config");
        let cfg = load_runtime_config(&args_with_config(&cfg_path)).expect("load");
        assert_eq!(cfg.inactivity_timeout, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("testhub.toml");
        fs::write(&cfg_path, "sokcet_path = \"/tmp/x\"\n").expect("write config");
        let err = load_runtime_config(&args_with_config(&cfg_path)).expect_err("typo");
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    #[test]
    fn default_locations_are_hub_specific() {
        let runtime = default_runtime_dir();
        let name = runtime.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("testhub"));
        if let Some(path) = user_config_file() {
            assert!(path.ends_with("testhub/testhub.toml"));
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_runtime_config(&args_with_config(&dir.path().join("nope.toml")))
            .expect_err("missing file");
        assert!(err.to_string().contains("failed to read config"));
    }
}
