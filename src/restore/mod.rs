//! Multi-host restore sequencing.
//!
//! A restore runs once per invocation through fixed phases:
//!
//! 1. stop the service on every host;
//! 2. stage backup-store credentials on every host;
//! 3. restore the shared datastore from the first reachable host, guarded by
//!    the latch in [`RestorePlan`];
//! 4. restore per-host artifacts (and optionally `setenv.sh`) on every host;
//! 5. start the service on every host, retrying once;
//! 6. verify every host answers HTTP locally.
//!
//! Any failure aborts the remaining phases and names the host and step.

use std::fmt;
use std::future::ready;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::poller::{PollFailure, PollOutcome, Poller};
use crate::session::{FileUpload, RemoteCommand, RemoteSession, SessionError, SessionFactory};
use crate::transport::CommandRunner;

pub mod commands;

pub use commands::{CREDENTIALS_DIR, DatastoreTarget, ServiceLayout};

/// Default delay between service liveness probes.
pub const DEFAULT_VERIFY_INTERVAL: Duration = Duration::from_secs(10);

/// Phases of a restore, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestorePhase {
    /// Stopping the service on every host.
    Stopping,
    /// Uploading backup-store credentials.
    CredentialStaging,
    /// Restoring the shared datastore once.
    DatastoreRestore,
    /// Restoring per-host artifacts.
    ArtifactRestore,
    /// Starting the service on every host.
    Starting,
    /// Probing every host until the service answers.
    Verifying,
}

/// Individual step within a phase, used to attribute failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestoreStep {
    /// Connecting to the host.
    Connect,
    /// Stopping the service.
    StopService,
    /// Uploading backup-store credentials.
    StageCredentials,
    /// Downloading the datastore dump.
    FetchDump,
    /// Creating the application database.
    CreateDatabase,
    /// Dropping and recreating an existing database.
    RecreateDatabase,
    /// Loading the dump.
    RestoreDatabase,
    /// Fetching and unpacking the artifact bundle.
    RestoreArtifacts,
    /// Uploading and installing `setenv.sh`.
    InstallSetenv,
    /// Starting the service.
    StartService,
    /// Waiting for the service to answer.
    VerifyService,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::StopService => "stop service",
            Self::StageCredentials => "stage credentials",
            Self::FetchDump => "fetch datastore dump",
            Self::CreateDatabase => "create database",
            Self::RecreateDatabase => "recreate database",
            Self::RestoreDatabase => "restore database",
            Self::RestoreArtifacts => "restore artifacts",
            Self::InstallSetenv => "install setenv.sh",
            Self::StartService => "start service",
            Self::VerifyService => "verify service",
        })
    }
}

/// Errors that abort a restore.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RestoreError {
    /// The plan named no hosts.
    #[error("restore plan has no target hosts")]
    EmptyPlan,
    /// A remote command exited non-zero.
    #[error("{step} failed on {host} with exit code {code}")]
    CommandFailed {
        /// Host the command ran on.
        host: String,
        /// Step being performed.
        step: RestoreStep,
        /// Exit code reported by the command.
        code: i32,
    },
    /// The session to a host failed.
    #[error("{step} failed on {host}: {source}")]
    Session {
        /// Host being contacted.
        host: String,
        /// Step being performed.
        step: RestoreStep,
        /// Underlying session failure.
        source: Box<SessionError>,
    },
    /// No host could be reached for a once-per-run step.
    #[error("no host was reachable to {step}")]
    NoReachableHost {
        /// Step that could not run.
        step: RestoreStep,
    },
    /// The service did not answer within the ceiling.
    #[error("{step} timed out on {host} after {}s (limit {}s)", .elapsed.as_secs(), .ceiling.as_secs())]
    Timeout {
        /// Host being probed.
        host: String,
        /// Step being performed.
        step: RestoreStep,
        /// Time spent waiting.
        elapsed: Duration,
        /// Configured ceiling.
        ceiling: Duration,
    },
}

impl RestoreError {
    /// Host the failure originated on, when there was one.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { host, .. }
            | Self::Session { host, .. }
            | Self::Timeout { host, .. } => Some(host),
            Self::EmptyPlan | Self::NoReachableHost { .. } => None,
        }
    }

    /// Returns `true` when the host could not be reached.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Session { source, .. } if source.is_unreachable())
    }

    /// Step the failure originated in, when there was one.
    #[must_use]
    pub const fn step(&self) -> Option<RestoreStep> {
        match self {
            Self::CommandFailed { step, .. }
            | Self::Session { step, .. }
            | Self::Timeout { step, .. }
            | Self::NoReachableHost { step } => Some(*step),
            Self::EmptyPlan => None,
        }
    }
}

/// Location of the backups in the backup store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupArtifacts {
    /// Bucket holding both objects.
    pub bucket: String,
    /// Key of the datastore dump.
    pub datastore_dump: String,
    /// Key of the per-host artifact bundle.
    pub artifact_bundle: String,
}

/// Local files granting hosts read access to the backup store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupCredentials {
    /// Credentials file uploaded as `.aws/credentials`.
    pub credentials_file: Utf8PathBuf,
    /// Client config file uploaded as `.aws/config`.
    pub config_file: Utf8PathBuf,
}

/// Everything a restore needs. The datastore is restored at most once per
/// plan, however many times [`RestoreSequencer::execute`] runs it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestorePlan {
    /// Shared datastore connection.
    pub datastore: DatastoreTarget,
    /// Backup objects.
    pub backups: BackupArtifacts,
    /// Backup-store credentials.
    pub credentials: BackupCredentials,
    /// Optional `setenv.sh` installed on every host.
    pub setenv_file: Option<Utf8PathBuf>,
    /// Hosts in restore order.
    pub target_hosts: Vec<String>,
    datastore_restored: bool,
}

impl RestorePlan {
    /// Builds a plan whose datastore has not been restored yet.
    #[must_use]
    pub const fn new(
        datastore: DatastoreTarget,
        backups: BackupArtifacts,
        credentials: BackupCredentials,
        target_hosts: Vec<String>,
    ) -> Self {
        Self {
            datastore,
            backups,
            credentials,
            setenv_file: None,
            target_hosts,
            datastore_restored: false,
        }
    }

    /// Installs `path` as `setenv.sh` during artifact restore.
    #[must_use]
    pub fn with_setenv_file(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.setenv_file = path;
        self
    }

    /// Returns `true` once the shared datastore has been restored.
    #[must_use]
    pub const fn datastore_restored(&self) -> bool {
        self.datastore_restored
    }
}

/// Summary of a completed restore.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreReport {
    /// Phases completed, in order.
    pub phases: Vec<RestorePhase>,
    /// Host that restored the datastore, or `None` when an earlier
    /// execution of the same plan had already restored it.
    pub datastore_host: Option<String>,
    /// Whether an existing database had to be dropped first.
    pub database_recreated: bool,
}

/// Drives the restore phases across every host.
#[derive(Debug)]
pub struct RestoreSequencer<'s, R: CommandRunner> {
    sessions: &'s SessionFactory<R>,
    layout: ServiceLayout,
    max_service_wait: Duration,
    verify_interval: Duration,
}

impl<'s, R: CommandRunner> RestoreSequencer<'s, R> {
    /// Creates a sequencer using the given session factory and layout.
    #[must_use]
    pub const fn new(
        sessions: &'s SessionFactory<R>,
        layout: ServiceLayout,
        max_service_wait: Duration,
    ) -> Self {
        Self {
            sessions,
            layout,
            max_service_wait,
            verify_interval: DEFAULT_VERIFY_INTERVAL,
        }
    }

    /// Overrides the delay between liveness probes.
    #[must_use]
    pub const fn with_verify_interval(mut self, interval: Duration) -> Self {
        self.verify_interval = interval;
        self
    }

    /// Runs every phase in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`RestoreError`]; later phases do not run.
    pub async fn execute(&self, plan: &mut RestorePlan) -> Result<RestoreReport, RestoreError> {
        if plan.target_hosts.is_empty() {
            return Err(RestoreError::EmptyPlan);
        }
        info!(hosts = plan.target_hosts.len(), "Restoring fleet");
        let mut phases = Vec::with_capacity(6);

        enter(RestorePhase::Stopping, &mut phases);
        for host in &plan.target_hosts {
            let session = self.open(host)?;
            run(&session, RestoreStep::StopService, commands::stop_service(&self.layout))?;
        }

        enter(RestorePhase::CredentialStaging, &mut phases);
        for host in &plan.target_hosts {
            let session = self.open(host)?;
            Self::stage_credentials(&session, &plan.credentials)?;
        }

        enter(RestorePhase::DatastoreRestore, &mut phases);
        let (datastore_host, database_recreated) = self.restore_datastore(plan)?;

        enter(RestorePhase::ArtifactRestore, &mut phases);
        for host in &plan.target_hosts {
            let session = self.open(host)?;
            run(
                &session,
                RestoreStep::RestoreArtifacts,
                commands::restore_artifacts(
                    &self.layout,
                    &plan.backups.bucket,
                    &plan.backups.artifact_bundle,
                ),
            )?;
            if let Some(ref setenv) = plan.setenv_file {
                self.install_setenv(&session, setenv)?;
            }
        }

        enter(RestorePhase::Starting, &mut phases);
        for host in &plan.target_hosts {
            let session = self.open(host)?;
            self.start(&session)?;
        }

        enter(RestorePhase::Verifying, &mut phases);
        for host in &plan.target_hosts {
            let session = self.open(host)?;
            self.verify(&session).await?;
        }

        info!(datastore_host = ?datastore_host, "Restore complete");
        Ok(RestoreReport {
            phases,
            datastore_host,
            database_recreated,
        })
    }

    fn open(&self, host: &str) -> Result<RemoteSession<'s, R>, RestoreError> {
        self.sessions
            .open(host)
            .map_err(|source| RestoreError::Session {
                host: host.to_owned(),
                step: RestoreStep::Connect,
                source: Box::new(source),
            })
    }

    fn stage_credentials(
        session: &RemoteSession<'_, R>,
        credentials: &BackupCredentials,
    ) -> Result<(), RestoreError> {
        let step = RestoreStep::StageCredentials;
        run(session, step, [commands::prepare_credentials_dir()])?;
        session
            .upload(&[
                FileUpload::new(credentials.credentials_file.clone(), CREDENTIALS_DIR),
                FileUpload::new(credentials.config_file.clone(), CREDENTIALS_DIR),
            ])
            .map_err(|source| session_error(session, step, source))
    }

    /// Restores the datastore on the first host that accepts a session and
    /// latches the plan. Returns the host used, if any, and whether the
    /// database had to be recreated.
    fn restore_datastore(
        &self,
        plan: &mut RestorePlan,
    ) -> Result<(Option<String>, bool), RestoreError> {
        if plan.datastore_restored {
            info!("Datastore already restored for this plan; skipping");
            return Ok((None, false));
        }

        let hosts = plan.target_hosts.clone();
        for host in &hosts {
            let session = match self.sessions.open(host) {
                Ok(session) => session,
                Err(err) if err.is_unreachable() => {
                    warn!(host = %host, error = %err, "Host unreachable; trying next host for datastore restore");
                    continue;
                }
                Err(source) => {
                    return Err(RestoreError::Session {
                        host: host.clone(),
                        step: RestoreStep::Connect,
                        source: Box::new(source),
                    });
                }
            };

            plan.datastore_restored = true;
            let recreated = self.restore_datastore_on(&session, plan)?;
            return Ok((Some(host.clone()), recreated));
        }

        Err(RestoreError::NoReachableHost {
            step: RestoreStep::RestoreDatabase,
        })
    }

    fn restore_datastore_on(
        &self,
        session: &RemoteSession<'_, R>,
        plan: &RestorePlan,
    ) -> Result<bool, RestoreError> {
        let datastore = &plan.datastore;
        info!(host = %session.host(), endpoint = %datastore.endpoint, "Restoring datastore");
        run(
            session,
            RestoreStep::FetchDump,
            [commands::fetch_object(
                &plan.backups.bucket,
                &plan.backups.datastore_dump,
            )],
        )?;

        let create_code = session
            .exec(datastore.create_database(&self.layout))
            .map_err(|source| session_error(session, RestoreStep::CreateDatabase, source))?;
        let recreated = create_code != 0;
        if recreated {
            info!(
                host = %session.host(),
                database = %self.layout.database_name,
                "Database already exists; terminating connections and recreating it"
            );
            run(
                session,
                RestoreStep::RecreateDatabase,
                datastore.recreate_database(&self.layout),
            )?;
        }

        let dump_file = commands::object_file_name(&plan.backups.datastore_dump);
        run(
            session,
            RestoreStep::RestoreDatabase,
            [datastore.restore_dump(&self.layout, dump_file)],
        )?;
        Ok(recreated)
    }

    fn install_setenv(
        &self,
        session: &RemoteSession<'_, R>,
        setenv: &Utf8Path,
    ) -> Result<(), RestoreError> {
        let step = RestoreStep::InstallSetenv;
        session
            .upload(&[FileUpload::new(setenv, ".")])
            .map_err(|source| session_error(session, step, source))?;
        let uploaded = setenv.file_name().unwrap_or("setenv.sh");
        run(session, step, [commands::install_setenv(&self.layout, uploaded)])
    }

    fn start(&self, session: &RemoteSession<'_, R>) -> Result<(), RestoreError> {
        let step = RestoreStep::StartService;
        match run(session, step, commands::start_service(&self.layout)) {
            Err(RestoreError::CommandFailed { code, .. }) => {
                warn!(host = %session.host(), code, "Service did not start; retrying once");
                run(session, step, commands::start_service(&self.layout))
            }
            other => other,
        }
    }

    async fn verify(&self, session: &RemoteSession<'_, R>) -> Result<(), RestoreError> {
        let step = RestoreStep::VerifyService;
        let probe = commands::probe_service(&self.layout);
        info!(host = %session.host(), "Waiting for service to answer");
        let outcome = Poller::bounded(self.max_service_wait, self.verify_interval)
            .wait_until(|| ready(probe_once(session, &probe)))
            .await?;

        if let PollOutcome::TimedOut {
            elapsed, ceiling, ..
        } = outcome
        {
            return Err(RestoreError::Timeout {
                host: session.host().to_owned(),
                step,
                elapsed,
                ceiling,
            });
        }
        info!(host = %session.host(), "Service is answering");
        Ok(())
    }
}

fn enter(phase: RestorePhase, phases: &mut Vec<RestorePhase>) {
    if let Some(previous) = phases.last() {
        info!(phase = ?previous, "Phase complete");
    }
    info!(phase = ?phase, "Entering phase");
    phases.push(phase);
}

fn run<R, C>(session: &RemoteSession<'_, R>, step: RestoreStep, commands: C) -> Result<(), RestoreError>
where
    R: CommandRunner,
    C: IntoIterator<Item = RemoteCommand>,
{
    let code = session
        .exec_all(commands)
        .map_err(|source| session_error(session, step, source))?;
    if code != 0 {
        return Err(RestoreError::CommandFailed {
            host: session.host().to_owned(),
            step,
            code,
        });
    }
    Ok(())
}

fn session_error<R: CommandRunner>(
    session: &RemoteSession<'_, R>,
    step: RestoreStep,
    source: SessionError,
) -> RestoreError {
    RestoreError::Session {
        host: session.host().to_owned(),
        step,
        source: Box::new(source),
    }
}

fn probe_once<R: CommandRunner>(
    session: &RemoteSession<'_, R>,
    probe: &RemoteCommand,
) -> Result<bool, PollFailure<RestoreError>> {
    match session.exec(probe) {
        Ok(code) => Ok(code == 0),
        Err(err) => {
            let error = session_error(session, RestoreStep::VerifyService, err);
            if error.is_unreachable() {
                Err(PollFailure::Transient(error))
            } else {
                Err(PollFailure::Fatal(error))
            }
        }
    }
}

#[cfg(test)]
mod tests;
