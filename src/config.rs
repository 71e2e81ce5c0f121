use std::{
    env,
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub mod ssh;

pub const DEFAULT_SETTINGS_FILE: &str = "./remote-pull.yaml";

/// Reads the settings file. A missing file at the default location yields the
/// defaults; a missing file that was asked for explicitly is an error.
pub fn read_settings(path: Option<PathBuf>) -> Result<Settings> {
    let explicit = path.is_some();
    let path = path.unwrap_or(DEFAULT_SETTINGS_FILE.into());

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => {
            debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Settings::default());
        }
        Err(err) => {
            return Err(Error::Settings {
                path,
                message: err.to_string(),
            })
        }
    };

    let settings: Settings =
        serde_yaml::from_reader(BufReader::new(file)).map_err(|err| Error::Settings {
            path: path.clone(),
            message: err.to_string(),
        })?;

    settings.validate().map_err(|message| Error::Settings { path, message })?;

    Ok(settings)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory on the remote host the sink writes into
    pub destination_dir: PathBuf,
    /// Bytes read from the source file per write
    pub chunk_size: usize,
    /// Mode announced in the file header
    pub file_mode: u32,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout_secs: u64,
    /// Ask for a password on the terminal instead of offering an empty one
    pub prompt_password: bool,
    /// Overrides `~/.ssh/config`
    pub ssh_config: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            destination_dir: "/tmp".into(),
            chunk_size: 32 * 1024,
            file_mode: 0o644,
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout_secs: 30,
            prompt_password: false,
            ssh_config: None,
        }
    }
}

impl Settings {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than zero".to_owned());
        }
        if self.file_mode > 0o7777 {
            return Err(format!("file_mode {:o} is not a permission mode", self.file_mode));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The SSH config file to resolve aliases against, if one can be located
    pub fn ssh_config_path(&self, env: &Environment) -> Option<PathBuf> {
        self.ssh_config
            .clone()
            .or_else(|| env.ssh_dir().map(|dir| dir.join("config")))
    }
}

/// How the server's host key is checked during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key. Open to man-in-the-middle attacks.
    #[default]
    AcceptAny,
    /// Require a matching entry in `~/.ssh/known_hosts`
    KnownHosts,
}

/// Process environment the resolver and credential chain depend on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub home: Option<PathBuf>,
    pub agent_socket: Option<PathBuf>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            home: env::var_os("HOME")
                .filter(|home| !home.is_empty())
                .map(PathBuf::from),
            agent_socket: env::var_os("SSH_AUTH_SOCK")
                .filter(|sock| !sock.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn ssh_dir(&self) -> Option<PathBuf> {
        self.home.as_deref().map(|home| home.join(".ssh"))
    }

    pub fn known_hosts(&self) -> Option<PathBuf> {
        self.ssh_dir().map(|dir| dir.join("known_hosts"))
    }

    pub fn with_home(home: impl AsRef<Path>) -> Self {
        Self {
            home: Some(home.as_ref().to_path_buf()),
            agent_socket: None,
        }
    }
}
