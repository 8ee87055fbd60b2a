//! Configuration loading via `ortho-config`.
//!
//! [`StackConfig`] merges defaults, the discovered `upkeep.toml`, and
//! `UPKEEP_*` environment variables. Validation errors name both the
//! environment variable and the TOML key that supply the value.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::fleet::AddressMode;
use crate::provider::{AwsCliSettings, DEFAULT_AWS_BIN, OnFailure};
use crate::restore::{BackupArtifacts, BackupCredentials};

/// Name of the configuration file mentioned in validation errors.
pub const CONFIG_FILE_NAME: &str = "upkeep.toml";

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE_URL: &str = "https://aws-quickstart.s3.amazonaws.com/quickstart-atlassian-jira/templates/quickstart-jira-dc-with-vpc.template.yaml";

/// Stack, fleet and restore settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "UPKEEP",
    discovery(
        app_name = "upkeep",
        env_var = "UPKEEP_CONFIG_PATH",
        config_file_name = "upkeep.toml",
        dotfile_name = ".upkeep.toml",
        project_file_name = "upkeep.toml"
    )
)]
pub struct StackConfig {
    /// Name of the stack to provision and tear down.
    #[ortho_config(default = "JIRA-Data-Center".to_owned())]
    pub stack_name: String,
    /// URL of the stack template.
    #[ortho_config(default = DEFAULT_TEMPLATE_URL.to_owned())]
    pub template_url: String,
    /// Region every provider call targets.
    #[ortho_config(default = "us-west-2".to_owned())]
    pub region: String,
    /// Named credentials profile for the `aws` CLI.
    pub aws_profile: Option<String>,
    /// Path to the `aws` executable.
    #[ortho_config(default = DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// Policy applied when stack creation fails: `DO_NOTHING`, `ROLLBACK`
    /// or `DELETE`.
    #[ortho_config(default = "DELETE".to_owned())]
    pub on_failure: String,
    /// Logical id of the load balancer in the template.
    #[ortho_config(default = "LoadBalancer".to_owned())]
    pub balancer_logical_id: String,
    /// Physical balancer name; skips the resource lookup when set.
    pub balancer_physical_id: Option<String>,
    /// Public base URL; defaults to the balancer DNS name.
    pub base_url: Option<String>,
    /// Logical id of the datastore in the template.
    #[ortho_config(default = "DB".to_owned())]
    pub datastore_logical_id: String,
    /// Physical datastore identifier; skips the resource lookup when set.
    pub datastore_physical_id: Option<String>,
    /// Administrator password for the datastore.
    pub datastore_password: Option<String>,
    /// Address used to reach hosts: `public` or `private`.
    #[ortho_config(default = "public".to_owned())]
    pub address_mode: String,
    /// Export file of `KEY="value"` lines.
    #[ortho_config(default = "upkeep/outputs.conf".to_owned())]
    pub outputs_file: String,
    /// Host list file; blank disables it.
    #[ortho_config(default = "upkeep/hosts".to_owned())]
    pub hosts_file: String,
    /// Base URL file; blank disables it.
    #[ortho_config(default = "upkeep/baseurl".to_owned())]
    pub base_url_file: String,
    /// Comma-separated output keys to export. Everything is exported when
    /// unset.
    pub exports: Option<String>,
    /// Ceiling in seconds for each host's service to answer after a restore,
    /// and for the public URL to answer.
    #[ortho_config(default = 300)]
    pub max_service_wait_secs: u64,
    /// Ceiling in seconds for the balancer health check.
    #[ortho_config(default = 300)]
    pub max_balancer_wait_secs: u64,
    /// Ceiling in seconds for each instance to start running. Unset waits
    /// indefinitely.
    pub instance_wait_secs: Option<u64>,
    /// Proceed when the instance wait times out instead of failing.
    #[ortho_config(default = false)]
    pub abandon_instance_wait: bool,
    /// Whether to restore the datastore and artifacts from backups.
    #[ortho_config(default = true)]
    pub restore_enabled: bool,
    /// Bucket holding the backups.
    pub backup_bucket: Option<String>,
    /// Key of the datastore dump.
    pub backup_datastore_dump: Option<String>,
    /// Key of the per-host artifact bundle.
    pub backup_artifact_bundle: Option<String>,
    /// Local credentials file granting hosts read access to the bucket.
    pub backup_credentials_file: Option<String>,
    /// Local client config file uploaded alongside the credentials.
    pub backup_config_file: Option<String>,
    /// Optional `setenv.sh` installed on every host.
    pub setenv_file: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, value: &str, expected: &str) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "invalid {} {value:?}: expected {expected} (set {} or {} in {CONFIG_FILE_NAME})",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const STACK_NAME: FieldMetadata = FieldMetadata::new("stack name", "UPKEEP_STACK_NAME", "stack_name");
const TEMPLATE_URL: FieldMetadata =
    FieldMetadata::new("template URL", "UPKEEP_TEMPLATE_URL", "template_url");
const REGION: FieldMetadata = FieldMetadata::new("region", "UPKEEP_REGION", "region");
const AWS_BIN: FieldMetadata = FieldMetadata::new("aws executable", "UPKEEP_AWS_BIN", "aws_bin");
const AWS_PROFILE: FieldMetadata =
    FieldMetadata::new("aws profile", "UPKEEP_AWS_PROFILE", "aws_profile");
const ON_FAILURE: FieldMetadata =
    FieldMetadata::new("on_failure policy", "UPKEEP_ON_FAILURE", "on_failure");
const ADDRESS_MODE: FieldMetadata =
    FieldMetadata::new("address_mode", "UPKEEP_ADDRESS_MODE", "address_mode");
const BALANCER_LOGICAL_ID: FieldMetadata = FieldMetadata::new(
    "balancer logical id",
    "UPKEEP_BALANCER_LOGICAL_ID",
    "balancer_logical_id",
);
const DATASTORE_LOGICAL_ID: FieldMetadata = FieldMetadata::new(
    "datastore logical id",
    "UPKEEP_DATASTORE_LOGICAL_ID",
    "datastore_logical_id",
);
const OUTPUTS_FILE: FieldMetadata =
    FieldMetadata::new("outputs file", "UPKEEP_OUTPUTS_FILE", "outputs_file");
const DATASTORE_PASSWORD: FieldMetadata = FieldMetadata::new(
    "datastore password",
    "UPKEEP_DATASTORE_PASSWORD",
    "datastore_password",
);
const BACKUP_BUCKET: FieldMetadata =
    FieldMetadata::new("backup bucket", "UPKEEP_BACKUP_BUCKET", "backup_bucket");
const BACKUP_DATASTORE_DUMP: FieldMetadata = FieldMetadata::new(
    "datastore dump key",
    "UPKEEP_BACKUP_DATASTORE_DUMP",
    "backup_datastore_dump",
);
const BACKUP_ARTIFACT_BUNDLE: FieldMetadata = FieldMetadata::new(
    "artifact bundle key",
    "UPKEEP_BACKUP_ARTIFACT_BUNDLE",
    "backup_artifact_bundle",
);
const BACKUP_CREDENTIALS_FILE: FieldMetadata = FieldMetadata::new(
    "backup credentials file",
    "UPKEEP_BACKUP_CREDENTIALS_FILE",
    "backup_credentials_file",
);
const BACKUP_CONFIG_FILE: FieldMetadata = FieldMetadata::new(
    "backup client config file",
    "UPKEEP_BACKUP_CONFIG_FILE",
    "backup_config_file",
);

/// Backup inputs for a restore, present only when restore is enabled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RestoreInputs {
    /// Backup objects.
    pub backups: BackupArtifacts,
    /// Credentials uploaded to each host.
    pub credentials: BackupCredentials,
    /// Datastore administrator password.
    pub datastore_password: String,
    /// Optional `setenv.sh`.
    pub setenv_file: Option<Utf8PathBuf>,
}

impl StackConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("upkeep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide the value via environment variables or the configuration
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidValue`] when a value cannot be parsed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_teardown()?;
        require(&self.template_url, &TEMPLATE_URL)?;
        self.on_failure_policy()?;
        self.address_mode()?;
        require(&self.balancer_logical_id, &BALANCER_LOGICAL_ID)?;
        require(&self.datastore_logical_id, &DATASTORE_LOGICAL_ID)?;
        require(&self.outputs_file, &OUTPUTS_FILE)?;
        self.restore_inputs()?;
        Ok(())
    }

    /// Validates only what deleting the stack needs: its name and the
    /// provider settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a missing name or malformed provider
    /// settings.
    pub fn validate_teardown(&self) -> Result<(), ConfigError> {
        require(&self.stack_name, &STACK_NAME)?;
        require(&self.region, &REGION)?;
        require(&self.aws_bin, &AWS_BIN)?;
        require_optional(self.aws_profile.as_deref(), &AWS_PROFILE)?;
        if !is_region(self.region.trim()) {
            return Err(REGION.invalid(&self.region, "a region code such as us-west-2"));
        }
        Ok(())
    }

    /// Parsed on-failure policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for an unknown policy.
    pub fn on_failure_policy(&self) -> Result<OnFailure, ConfigError> {
        self.on_failure
            .parse()
            .map_err(|_| ON_FAILURE.invalid(&self.on_failure, "DO_NOTHING, ROLLBACK or DELETE"))
    }

    /// Parsed host address mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything other than
    /// `public` or `private`.
    pub fn address_mode(&self) -> Result<AddressMode, ConfigError> {
        match self.address_mode.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(AddressMode::Public),
            "private" => Ok(AddressMode::Private),
            _ => Err(ADDRESS_MODE.invalid(&self.address_mode, "public or private")),
        }
    }

    /// Settings for the `aws` CLI provider.
    #[must_use]
    pub fn aws_settings(&self) -> AwsCliSettings {
        AwsCliSettings {
            aws_bin: self.aws_bin.trim().to_owned(),
            region: self.region.trim().to_owned(),
            profile: non_blank(self.aws_profile.as_deref()),
        }
    }

    /// Output keys to export; empty means everything.
    #[must_use]
    pub fn export_keys(&self) -> Vec<String> {
        self.exports
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Configured balancer name, if any.
    #[must_use]
    pub fn balancer_override(&self) -> Option<String> {
        non_blank(self.balancer_physical_id.as_deref())
    }

    /// Configured datastore identifier, if any.
    #[must_use]
    pub fn datastore_override(&self) -> Option<String> {
        non_blank(self.datastore_physical_id.as_deref())
    }

    /// Configured base URL, if any.
    #[must_use]
    pub fn base_url_override(&self) -> Option<String> {
        non_blank(self.base_url.as_deref())
    }

    /// Export file location.
    #[must_use]
    pub fn outputs_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.outputs_file.trim())
    }

    /// Host list location, unless disabled.
    #[must_use]
    pub fn hosts_path(&self) -> Option<Utf8PathBuf> {
        non_blank(Some(&self.hosts_file)).map(Utf8PathBuf::from)
    }

    /// Base URL file location, unless disabled.
    #[must_use]
    pub fn base_url_path(&self) -> Option<Utf8PathBuf> {
        non_blank(Some(&self.base_url_file)).map(Utf8PathBuf::from)
    }

    /// Ceiling for services to answer.
    #[must_use]
    pub const fn service_wait(&self) -> Duration {
        Duration::from_secs(self.max_service_wait_secs)
    }

    /// Ceiling for the balancer health check.
    #[must_use]
    pub const fn balancer_wait(&self) -> Duration {
        Duration::from_secs(self.max_balancer_wait_secs)
    }

    /// Ceiling for each instance to start running.
    #[must_use]
    pub fn instance_wait(&self) -> Option<Duration> {
        self.instance_wait_secs.map(Duration::from_secs)
    }

    /// Backup inputs when restore is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first missing backup
    /// setting.
    pub fn restore_inputs(&self) -> Result<Option<RestoreInputs>, ConfigError> {
        if !self.restore_enabled {
            return Ok(None);
        }
        let bucket = required(self.backup_bucket.as_deref(), &BACKUP_BUCKET)?;
        let datastore_dump = required(self.backup_datastore_dump.as_deref(), &BACKUP_DATASTORE_DUMP)?;
        let artifact_bundle =
            required(self.backup_artifact_bundle.as_deref(), &BACKUP_ARTIFACT_BUNDLE)?;
        let credentials_file =
            required(self.backup_credentials_file.as_deref(), &BACKUP_CREDENTIALS_FILE)?;
        let config_file = required(self.backup_config_file.as_deref(), &BACKUP_CONFIG_FILE)?;
        let datastore_password = required(self.datastore_password.as_deref(), &DATASTORE_PASSWORD)?;

        Ok(Some(RestoreInputs {
            backups: BackupArtifacts {
                bucket,
                datastore_dump,
                artifact_bundle,
            },
            credentials: BackupCredentials {
                credentials_file: Utf8PathBuf::from(credentials_file),
                config_file: Utf8PathBuf::from(config_file),
            },
            datastore_password,
            setenv_file: self.existing_setenv_file(),
        }))
    }

    /// The configured `setenv.sh`, when it names a regular file. Anything
    /// else is logged and skipped.
    fn existing_setenv_file(&self) -> Option<Utf8PathBuf> {
        let path = Utf8PathBuf::from(non_blank(self.setenv_file.as_deref())?);
        if is_local_file(&path) {
            Some(path)
        } else {
            warn!(path = %path, "setenv file does not exist or is not a file; skipping install");
            None
        }
    }
}

fn is_local_file(path: &Utf8Path) -> bool {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let Some(file_name) = path.file_name() else {
        return false;
    };
    Dir::open_ambient_dir(parent, ambient_authority()).is_ok_and(|dir| dir.is_file(file_name))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

fn required(value: Option<&str>, metadata: &FieldMetadata) -> Result<String, ConfigError> {
    non_blank(value).ok_or_else(|| metadata.missing())
}

fn require(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    required(Some(value), metadata).map(|_| ())
}

fn require_optional(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value {
        Some(raw) => require(raw, metadata),
        None => Ok(()),
    }
}

/// Accepts codes shaped like `us-west-2` or `us-gov-east-1`.
fn is_region(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let Some((number, rest)) = parts.split_last() else {
        return false;
    };
    let lowercase = |part: &&str| !part.is_empty() && part.chars().all(|c| c.is_ascii_lowercase());
    rest.len() >= 2
        && rest.first().is_some_and(|country| country.len() == 2 && lowercase(country))
        && rest.iter().all(lowercase)
        && !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value that cannot be interpreted.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
