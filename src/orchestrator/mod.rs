//! Drives a full rollout and its teardown.
//!
//! `start` runs a fixed pipeline: provision the stack and wait for it,
//! export its outputs, resolve the fleet and wait for every instance, restore
//! backups, apply per-host extras, gate on balancer health, wait for the
//! public URL and record it. Every step either completes or aborts the run;
//! retries only happen inside the pollers of a single step.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, StackConfig};
use crate::exports::{self, ExportError};
use crate::fleet::{
    DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_INSTANCE_POLL_INTERVAL, FleetError, FleetGate,
};
use crate::liveness::{DEFAULT_LIVENESS_INTERVAL, LivenessError, LivenessProbe, await_liveness};
use crate::manifest::RunManifest;
use crate::provider::{ProviderError, ResourceProvider, StackHandle};
use crate::restore::{
    DEFAULT_VERIFY_INTERVAL, DatastoreTarget, RestoreError, RestorePlan, RestoreReport,
    RestoreSequencer, ServiceLayout,
};
use crate::session::{FileUpload, SessionError, SessionFactory};
use crate::stack::{
    DEFAULT_STACK_POLL_INTERVAL, StackError, StackSnapshot, StackState, StackStatus, StackWatcher,
};
use crate::transport::CommandRunner;

/// Directory on each host that receives extra uploads.
const EXTRA_UPLOAD_DIR: &str = ".";

/// Poll cadences for every wait in the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RolloutTimings {
    /// Between stack status checks.
    pub stack_poll: Duration,
    /// Between instance status checks.
    pub instance_poll: Duration,
    /// Between balancer health checks.
    pub health_poll: Duration,
    /// Between on-host service probes after a restore.
    pub service_verify: Duration,
    /// Between public URL probes.
    pub liveness_poll: Duration,
}

impl Default for RolloutTimings {
    fn default() -> Self {
        Self {
            stack_poll: DEFAULT_STACK_POLL_INTERVAL,
            instance_poll: DEFAULT_INSTANCE_POLL_INTERVAL,
            health_poll: DEFAULT_HEALTH_POLL_INTERVAL,
            service_verify: DEFAULT_VERIFY_INTERVAL,
            liveness_poll: DEFAULT_LIVENESS_INTERVAL,
        }
    }
}

/// Errors that abort a run. Each names the step it came from.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OrchestratorError {
    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Provisioning or inspecting the stack failed.
    #[error("provision stack {stack}: {source}")]
    Provision {
        /// Stack name.
        stack: String,
        /// Underlying failure.
        source: Box<StackError>,
    },
    /// The stack settled in a state other than complete.
    #[error("stack {stack} finished as {state}{}", .reason.as_deref().map_or_else(String::new, |r| format!(": {r}")))]
    StackNotComplete {
        /// Stack name.
        stack: String,
        /// Terminal state reached.
        state: StackState,
        /// Provider explanation.
        reason: Option<String>,
    },
    /// Writing persisted state failed.
    #[error("persist rollout state: {0}")]
    Export(#[from] ExportError),
    /// A logical resource was missing from the stack.
    #[error("resolve {what}: no resource with logical id {logical_id} in stack {stack}")]
    ResourceNotFound {
        /// What was being resolved.
        what: &'static str,
        /// Logical id looked up.
        logical_id: String,
        /// Stack name.
        stack: String,
    },
    /// Resolving or waiting on the fleet failed.
    #[error("{step}: {source}")]
    Fleet {
        /// Step being performed.
        step: &'static str,
        /// Underlying failure.
        source: Box<FleetError>,
    },
    /// Looking up the datastore endpoint failed.
    #[error("resolve datastore endpoint for {datastore}: {source}")]
    Datastore {
        /// Datastore identifier.
        datastore: String,
        /// Underlying failure.
        source: Box<ProviderError>,
    },
    /// The restore aborted.
    #[error("restore: {0}")]
    Restore(#[from] RestoreError),
    /// Connecting to or uploading extras to a host failed.
    #[error("apply extras on {host}: {source}")]
    ExtrasSession {
        /// Host being prepared.
        host: String,
        /// Underlying failure.
        source: Box<SessionError>,
    },
    /// An extra command exited non-zero.
    #[error("apply extras on {host}: `{command}` exited with code {code}")]
    ExtrasCommand {
        /// Host the command ran on.
        host: String,
        /// Command as written in the manifest.
        command: String,
        /// Exit code.
        code: i32,
    },
    /// The public URL never answered.
    #[error("wait for public URL: {0}")]
    Liveness(#[from] LivenessError),
    /// Deleting the stack failed.
    #[error("delete stack {stack}: {source}")]
    Teardown {
        /// Stack name.
        stack: String,
        /// Underlying failure.
        source: Box<StackError>,
    },
    /// The stack did not disappear.
    #[error("stack {stack} was not deleted; it finished as {state}")]
    StackNotDeleted {
        /// Stack name.
        stack: String,
        /// Terminal state reached.
        state: StackState,
    },
}

/// What a successful `start` produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RolloutSummary {
    /// Final stack status.
    pub stack: StackStatus,
    /// Balancer fronting the fleet.
    pub balancer: String,
    /// Hosts in rollout order.
    pub hosts: Vec<String>,
    /// Public base URL.
    pub base_url: String,
    /// Restore report, when a restore ran.
    pub restore: Option<RestoreReport>,
}

/// Runs `start` for one configured stack.
#[derive(Debug)]
pub struct RolloutOrchestrator<P, R, L>
where
    P: ResourceProvider,
    R: CommandRunner,
    L: LivenessProbe,
{
    config: StackConfig,
    manifest: RunManifest,
    provider: P,
    sessions: SessionFactory<R>,
    probe: L,
    layout: ServiceLayout,
    timings: RolloutTimings,
}

impl<P, R, L> RolloutOrchestrator<P, R, L>
where
    P: ResourceProvider,
    R: CommandRunner,
    L: LivenessProbe,
{
    /// Creates an orchestrator with default cadences and service layout.
    #[must_use]
    pub fn new(
        config: StackConfig,
        manifest: RunManifest,
        provider: P,
        sessions: SessionFactory<R>,
        probe: L,
    ) -> Self {
        Self {
            config,
            manifest,
            provider,
            sessions,
            probe,
            layout: ServiceLayout::default(),
            timings: RolloutTimings::default(),
        }
    }

    /// Overrides the poll cadences.
    ///
    /// This is primarily used by tests together with paused time.
    #[must_use]
    pub const fn with_timings(mut self, timings: RolloutTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Overrides where the service lives on each host.
    #[must_use]
    pub fn with_layout(mut self, layout: ServiceLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Runs the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first [`OrchestratorError`]; later steps do not run.
    pub async fn start(&self) -> Result<RolloutSummary, OrchestratorError> {
        self.config.validate()?;
        let stack_name = self.config.stack_name.trim();

        let stack = self.provision(stack_name).await?;
        let snapshot = self.export_outputs(stack_name).await?;

        let balancer = self.resolve_balancer(stack_name, &snapshot)?;
        let gate = FleetGate::new(&self.provider, self.config.address_mode()?)
            .with_instance_poll_interval(self.timings.instance_poll)
            .abandon_instance_wait(self.config.abandon_instance_wait);
        let members = gate
            .resolve_members(&balancer)
            .await
            .map_err(|err| fleet_error("resolve fleet", err))?;
        let base_url = self
            .config
            .base_url_override()
            .unwrap_or_else(|| members.balancer_dns.clone());
        let datastore_id = self.resolve_datastore(stack_name, &snapshot)?;

        gate.await_instances_running(&members, self.config.instance_wait())
            .await
            .map_err(|err| fleet_error("wait for instances", err))?;
        let topology = gate
            .resolve_addresses(members)
            .await
            .map_err(|err| fleet_error("resolve host addresses", err))?;
        let hosts = topology.hosts();
        if let Some(path) = self.config.hosts_path() {
            exports::write_hosts(&path, &hosts)?;
        }

        let restore = self.restore(&datastore_id, &hosts).await?;
        self.apply_extras(&hosts)?;

        info!("Waiting for the balancer health check to pass");
        gate.await_health_check(
            &topology.balancer,
            self.config.balancer_wait(),
            self.timings.health_poll,
        )
        .await
        .map_err(|err| fleet_error("wait for balancer health", err))?;

        await_liveness(
            &self.probe,
            &base_url,
            self.config.service_wait(),
            self.timings.liveness_poll,
        )
        .await?;

        if let Some(path) = self.config.base_url_path() {
            exports::write_base_url(&path, &base_url)?;
        }

        info!(stack = stack_name, base_url = %base_url, hosts = hosts.len(), "Rollout complete");
        Ok(RolloutSummary {
            stack,
            balancer: topology.balancer,
            hosts,
            base_url,
            restore,
        })
    }

    async fn provision(&self, stack_name: &str) -> Result<StackStatus, OrchestratorError> {
        let watcher =
            StackWatcher::new(&self.provider).with_poll_interval(self.timings.stack_poll);
        let handle = StackHandle {
            name: stack_name.to_owned(),
            template_url: self.config.template_url.trim().to_owned(),
            parameters: self.manifest.parameters.clone(),
            on_failure: self.config.on_failure_policy()?,
        };
        let provision_error = |err: StackError| OrchestratorError::Provision {
            stack: stack_name.to_owned(),
            source: Box::new(err),
        };

        watcher.create(&handle).await.map_err(provision_error)?;
        let status = watcher
            .await_terminal(stack_name)
            .await
            .map_err(provision_error)?;
        if status.state != StackState::Complete {
            return Err(OrchestratorError::StackNotComplete {
                stack: stack_name.to_owned(),
                state: status.state,
                reason: status.reason,
            });
        }
        info!(stack = stack_name, "Stack created");
        Ok(status)
    }

    async fn export_outputs(&self, stack_name: &str) -> Result<StackSnapshot, OrchestratorError> {
        let snapshot = StackWatcher::new(&self.provider)
            .describe(stack_name)
            .await
            .map_err(|err| OrchestratorError::Provision {
                stack: stack_name.to_owned(),
                source: Box::new(err),
            })?;
        exports::write_outputs(
            &self.config.outputs_path(),
            &snapshot.outputs,
            &self.config.export_keys(),
        )?;
        Ok(snapshot)
    }

    fn resolve_balancer(
        &self,
        stack_name: &str,
        snapshot: &StackSnapshot,
    ) -> Result<String, OrchestratorError> {
        if let Some(physical) = self.config.balancer_override() {
            return Ok(physical);
        }
        let logical_id = self.config.balancer_logical_id.trim();
        snapshot
            .physical_id(logical_id)
            .map(str::to_owned)
            .ok_or_else(|| OrchestratorError::ResourceNotFound {
                what: "load balancer",
                logical_id: logical_id.to_owned(),
                stack: stack_name.to_owned(),
            })
    }

    fn resolve_datastore(
        &self,
        stack_name: &str,
        snapshot: &StackSnapshot,
    ) -> Result<String, OrchestratorError> {
        if let Some(physical) = self.config.datastore_override() {
            return Ok(physical);
        }
        let logical_id = self.config.datastore_logical_id.trim();
        snapshot
            .physical_id(logical_id)
            .map(str::to_owned)
            .ok_or_else(|| OrchestratorError::ResourceNotFound {
                what: "datastore",
                logical_id: logical_id.to_owned(),
                stack: stack_name.to_owned(),
            })
    }

    async fn restore(
        &self,
        datastore_id: &str,
        hosts: &[String],
    ) -> Result<Option<RestoreReport>, OrchestratorError> {
        let Some(inputs) = self.config.restore_inputs()? else {
            info!("No backup restore configured; skipping");
            return Ok(None);
        };

        let endpoint = self
            .provider
            .datastore_endpoint(datastore_id)
            .await
            .map_err(|err| OrchestratorError::Datastore {
                datastore: datastore_id.to_owned(),
                source: Box::new(err),
            })?;
        let mut plan = RestorePlan::new(
            DatastoreTarget {
                endpoint,
                password: inputs.datastore_password,
            },
            inputs.backups,
            inputs.credentials,
            hosts.to_vec(),
        )
        .with_setenv_file(inputs.setenv_file);

        let report = RestoreSequencer::new(
            &self.sessions,
            self.layout.clone(),
            self.config.service_wait(),
        )
        .with_verify_interval(self.timings.service_verify)
        .execute(&mut plan)
        .await?;
        Ok(Some(report))
    }

    fn apply_extras(&self, hosts: &[String]) -> Result<(), OrchestratorError> {
        if !self.manifest.has_extras() {
            return Ok(());
        }
        let uploads: Vec<FileUpload> = self
            .manifest
            .uploads
            .iter()
            .map(|path| FileUpload::new(path.clone(), EXTRA_UPLOAD_DIR))
            .collect();

        for host in hosts {
            let session_error = |err: SessionError| OrchestratorError::ExtrasSession {
                host: host.clone(),
                source: Box::new(err),
            };
            info!(host = %host, uploads = uploads.len(), commands = self.manifest.commands.len(), "Applying extras");
            let session = self.sessions.open(host).map_err(session_error)?;
            session.upload(&uploads).map_err(session_error)?;
            for command in &self.manifest.commands {
                let code = session.exec(command.as_str()).map_err(session_error)?;
                if code != 0 {
                    return Err(OrchestratorError::ExtrasCommand {
                        host: host.clone(),
                        command: command.clone(),
                        code,
                    });
                }
            }
        }
        Ok(())
    }
}

fn fleet_error(step: &'static str, err: FleetError) -> OrchestratorError {
    OrchestratorError::Fleet {
        step,
        source: Box::new(err),
    }
}

/// Deletes a stack and waits for it to disappear.
#[derive(Debug)]
pub struct StackTeardown<P: ResourceProvider> {
    provider: P,
    stack_name: String,
    poll_interval: Duration,
}

impl<P: ResourceProvider> StackTeardown<P> {
    /// Creates a teardown for `stack_name`.
    #[must_use]
    pub fn new(provider: P, stack_name: impl Into<String>) -> Self {
        Self {
            provider,
            stack_name: stack_name.into(),
            poll_interval: DEFAULT_STACK_POLL_INTERVAL,
        }
    }

    /// Overrides the poll cadence.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Requests deletion and waits until the stack is gone. A stack that
    /// does not exist counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Teardown`] when the provider fails and
    /// [`OrchestratorError::StackNotDeleted`] when deletion settles in any
    /// other state.
    pub async fn execute(&self) -> Result<StackStatus, OrchestratorError> {
        let status = StackWatcher::new(&self.provider)
            .with_poll_interval(self.poll_interval)
            .delete(&self.stack_name)
            .await
            .map_err(|err| OrchestratorError::Teardown {
                stack: self.stack_name.clone(),
                source: Box::new(err),
            })?;
        if !status.is_gone() {
            return Err(OrchestratorError::StackNotDeleted {
                stack: self.stack_name.clone(),
                state: status.state,
            });
        }
        info!(stack = %self.stack_name, "Stack deleted");
        Ok(status)
    }
}
