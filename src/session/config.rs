//! SSH session configuration and errors.
//!
//! [`SessionConfig`] is loaded via `ortho-config`, merging defaults, the
//! discovered `upkeep.toml`, and `UPKEEP_SSH_*` environment variables.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::SpawnError;

use super::types::{RelayTarget, SessionCredentials};

/// Default login user on freshly provisioned hosts.
pub const DEFAULT_SSH_USER: &str = "ec2-user";

/// SSH and SCP settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "UPKEEP_SSH",
    discovery(
        app_name = "upkeep",
        env_var = "UPKEEP_CONFIG_PATH",
        config_file_name = "upkeep.toml",
        dotfile_name = ".upkeep.toml",
        project_file_name = "upkeep.toml"
    )
)]
pub struct SessionConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub ssh_user: String,
    /// SSH port exposed by every target host.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for both the relay and the target hosts. Supports
    /// tilde expansion.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode so a missing key never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled by default because
    /// hosts are freshly provisioned.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds an idle control master survives after the last client exits.
    #[ortho_config(default = 300)]
    pub control_persist_secs: u64,
    /// Bastion host used to reach private addresses. Unset means hosts are
    /// reached directly on their public DNS names.
    pub relay_host: Option<String>,
    /// Login user on the bastion; defaults to `ssh_user`.
    pub relay_user: Option<String>,
    /// SSH port on the bastion.
    #[ortho_config(default = 22)]
    pub relay_port: u16,
}

/// Errors raised when loading the session configuration from layered
/// sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SessionConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SessionConfig {
    /// Loads configuration from defaults, files and environment without
    /// consulting the process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SessionConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SessionConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("upkeep")])
            .map_err(|err| SessionConfigLoadError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        require_value(&self.ssh_bin, "ssh_bin")?;
        require_value(&self.scp_bin, "scp_bin")?;
        require_value(&self.ssh_user, "ssh_user")?;
        require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        require_optional_value(self.relay_host.as_deref(), "relay_host")?;
        require_optional_value(self.relay_user.as_deref(), "relay_user")?;
        if self.ssh_port == 0 {
            return Err(SessionError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    /// Login credentials shared by every target host.
    #[must_use]
    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            user: self.ssh_user.clone(),
            identity_file: self.ssh_identity_file.clone(),
        }
    }

    /// Bastion hop, when one is configured.
    #[must_use]
    pub fn relay(&self) -> Option<RelayTarget> {
        self.relay_host.as_ref().map(|host| RelayTarget {
            user: self
                .relay_user
                .clone()
                .unwrap_or_else(|| self.ssh_user.clone()),
            host: host.clone(),
            port: self.relay_port,
        })
    }

    /// Returns `true` when hosts must be reached through a bastion.
    #[must_use]
    pub const fn uses_relay(&self) -> bool {
        self.relay_host.is_some()
    }
}

fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), SessionError> {
    match value {
        None => Ok(()),
        Some(v) if !v.trim().is_empty() => Ok(()),
        Some(_) => Err(SessionError::InvalidConfig {
            field: field.to_owned(),
        }),
    }
}

fn require_value(value: &str, field: &str) -> Result<(), SessionError> {
    require_optional_value(Some(value), field)
}

/// Errors surfaced while opening or using a remote session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set UPKEEP_SSH_{env_suffix} or add {field} to upkeep.toml", env_suffix = .field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// The host could not be reached or refused authentication. Callers may
    /// treat this as transient.
    #[error("host {host} is unreachable: {message}")]
    Unreachable {
        /// Host that could not be reached.
        host: String,
        /// Diagnostic captured from the SSH client.
        message: String,
    },
    /// The local `ssh` or `scp` binary could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// A file transfer finished with a non-zero exit code.
    #[error("upload of {source_path} to {host}:{destination_dir} failed with status {status_text}: {stderr}")]
    Upload {
        /// Target host.
        host: String,
        /// Local file that was being copied.
        source_path: String,
        /// Remote directory receiving the file.
        destination_dir: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from `scp`.
        stderr: String,
    },
    /// The SSH client finished without an exit status (killed by a signal).
    #[error("ssh to {host} did not return an exit code")]
    MissingExitCode {
        /// Target host.
        host: String,
    },
}

impl SessionError {
    /// Returns `true` for failures that mean the host could not be reached,
    /// as opposed to a command that ran and failed.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}
