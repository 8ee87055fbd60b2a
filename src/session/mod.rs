//! Authenticated remote sessions over the system `ssh` client.
//!
//! A [`RemoteSession`] owns one OpenSSH control master. Opening the session
//! authenticates once and proves the host is reachable; every later command
//! and `scp` transfer multiplexes over the same control socket. Sessions
//! optionally tunnel through a bastion via `ProxyJump`, which is invisible to
//! callers. Dropping a session that was not closed explicitly tears the
//! control master down.

use std::ffi::OsString;

use tracing::{info, warn};
use uuid::Uuid;

use crate::transport::{CommandRunner, expand_tilde};

mod command;
mod config;
mod types;

pub use command::RemoteCommand;
pub use config::{DEFAULT_SSH_USER, SessionConfig, SessionConfigLoadError, SessionError};
pub use types::{FileUpload, RelayTarget, SessionCredentials, SessionTarget};

/// Exit status OpenSSH reserves for its own connection failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Opens sessions for any host using one validated configuration and runner.
#[derive(Clone, Debug)]
pub struct SessionFactory<R: CommandRunner> {
    config: SessionConfig,
    runner: R,
}

impl<R: CommandRunner> SessionFactory<R> {
    /// Creates a factory after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when validation fails.
    pub fn new(config: SessionConfig, runner: R) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the command runner used for `ssh` and `scp`.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Opens a session to `host` using the configured credentials and relay.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::open`].
    pub fn open(&self, host: &str) -> Result<RemoteSession<'_, R>, SessionError> {
        let target = SessionTarget {
            host: host.to_owned(),
            port: self.config.ssh_port,
        };
        RemoteSession::open(
            &self.runner,
            &self.config,
            target,
            self.config.credentials(),
            self.config.relay(),
        )
    }
}

/// A live control-master connection to one host.
#[derive(Debug)]
pub struct RemoteSession<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a SessionConfig,
    target: SessionTarget,
    credentials: SessionCredentials,
    relay: Option<RelayTarget>,
    control_path: String,
    open: bool,
}

impl<'a, R: CommandRunner> RemoteSession<'a, R> {
    /// Establishes the control master and verifies the host answers.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unreachable`] when the connection or
    /// authentication fails, and [`SessionError::Spawn`] when `ssh` cannot be
    /// started.
    pub fn open(
        runner: &'a R,
        config: &'a SessionConfig,
        target: SessionTarget,
        credentials: SessionCredentials,
        relay: Option<RelayTarget>,
    ) -> Result<Self, SessionError> {
        let control_path = format!("{}/upkeep-{}", std::env::temp_dir().display(), Uuid::new_v4().simple());
        let mut session = Self {
            runner,
            config,
            target,
            credentials,
            relay,
            control_path,
            open: false,
        };

        info!(host = %session.target.host, relay = ?session.relay.as_ref().map(RelayTarget::jump_spec), "Connecting");
        let mut args = session.ssh_options();
        args.push(OsString::from(session.destination()));
        args.push(OsString::from("true"));
        let output = runner.run(&config.ssh_bin, &args)?;
        if !output.is_success() {
            return Err(SessionError::Unreachable {
                host: session.target.host.clone(),
                message: diagnostic(&output.stderr, &output.status_text()),
            });
        }

        session.open = true;
        Ok(session)
    }

    /// Host this session is connected to.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.target.host
    }

    /// Runs `command` and returns its exit code. Output is forwarded by the
    /// runner as it arrives.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unreachable`] when the connection drops, and
    /// [`SessionError::MissingExitCode`] when `ssh` is killed by a signal.
    pub fn exec(&self, command: impl Into<RemoteCommand>) -> Result<i32, SessionError> {
        let remote = command.into();
        info!(host = %self.target.host, command = %remote, "Running remote command");

        let mut args = self.ssh_options();
        args.push(OsString::from(self.destination()));
        args.push(OsString::from(remote.as_str()));
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        let Some(code) = output.code else {
            return Err(SessionError::MissingExitCode {
                host: self.target.host.clone(),
            });
        };

        if code == SSH_CONNECTION_FAILURE {
            return Err(SessionError::Unreachable {
                host: self.target.host.clone(),
                message: diagnostic(&output.stderr, &output.status_text()),
            });
        }

        info!(host = %self.target.host, code, "Remote command finished");
        Ok(code)
    }

    /// Runs `commands` in order, stopping at the first non-zero exit code.
    ///
    /// Returns `0` when every command succeeded, otherwise the first failing
    /// code. Later commands are not run.
    ///
    /// # Errors
    ///
    /// Propagates transport errors from [`RemoteSession::exec`].
    pub fn exec_all<I, C>(&self, commands: I) -> Result<i32, SessionError>
    where
        I: IntoIterator<Item = C>,
        C: Into<RemoteCommand>,
    {
        for command in commands {
            let code = self.exec(command)?;
            if code != 0 {
                return Ok(code);
            }
        }
        Ok(0)
    }

    /// Copies each file into its destination directory over the control
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Upload`] for the first transfer that fails.
    pub fn upload(&self, files: &[FileUpload]) -> Result<(), SessionError> {
        for file in files {
            info!(host = %self.target.host, source = %file.source, destination = %file.destination_dir, "Uploading");
            let mut args = self.scp_options();
            args.push(OsString::from(file.source.as_str()));
            args.push(OsString::from(format!(
                "{}:{}/",
                self.destination(),
                file.destination_dir.trim_end_matches('/')
            )));

            let output = self.runner.run(&self.config.scp_bin, &args)?;
            if !output.is_success() {
                return Err(SessionError::Upload {
                    host: self.target.host.clone(),
                    source_path: file.source.to_string(),
                    destination_dir: file.destination_dir.clone(),
                    status_text: output.status_text(),
                    stderr: output.stderr,
                });
            }
        }
        Ok(())
    }

    /// Shuts down the control master.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] when `ssh` cannot be started.
    pub fn close(mut self) -> Result<(), SessionError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SessionError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-O"),
            OsString::from("exit"),
        ];
        args.push(OsString::from(self.destination()));
        let output = self.runner.run(&self.config.ssh_bin, &args)?;
        if !output.is_success() {
            warn!(host = %self.target.host, stderr = %output.stderr.trim(), "Control master did not exit cleanly");
        }
        Ok(())
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.credentials.user, self.target.host)
    }

    fn ssh_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
        ];
        args.extend(self.shared_options());
        args
    }

    fn scp_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-q"),
            OsString::from("-P"),
            OsString::from(self.target.port.to_string()),
        ];
        args.extend(self.shared_options());
        args
    }

    fn shared_options(&self) -> Vec<OsString> {
        let mut args = Vec::new();

        if let Some(ref identity_file) = self.credentials.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        let mut options = vec![
            String::from("ControlMaster=auto"),
            format!("ControlPath={}", self.control_path),
            format!("ControlPersist={}", self.config.control_persist_secs),
        ];
        if self.config.ssh_batch_mode {
            options.push(String::from("BatchMode=yes"));
        }
        if !self.config.ssh_strict_host_key_checking {
            options.push(String::from("StrictHostKeyChecking=no"));
        }
        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            options.push(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            ));
        }
        if let Some(ref relay) = self.relay {
            options.push(format!("ProxyJump={}", relay.jump_spec()));
        }

        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args
    }
}

impl<R: CommandRunner> Drop for RemoteSession<'_, R> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(host = %self.target.host, error = %err, "Failed to close session");
        }
    }
}

fn diagnostic(stderr: &str, status_text: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("ssh exited with status {status_text}")
    } else {
        trimmed.to_owned()
    }
}
