//! Structured run inputs read from the discovered `upkeep.toml`.
//!
//! Flat settings go through `ortho-config`; tables that do not map onto
//! environment variables live here:
//!
//! ```toml
//! [parameters]
//! KeyPairName = "ci"
//! ClusterNodeMax = 2
//!
//! [extras]
//! uploads = ["fixtures/seed.sql"]
//! commands = ["sudo systemctl restart collectd"]
//! ```

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use ortho_config::toml;
use thiserror::Error;

const APP_NAME: &str = "upkeep";
const CONFIG_ENV_VAR: &str = "UPKEEP_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "upkeep.toml";
const DOTFILE_NAME: &str = ".upkeep.toml";
const PROJECT_FILE_NAME: &str = "upkeep.toml";
const PARAMETERS_SECTION: &str = "parameters";
const EXTRAS_SECTION: &str = "extras";

/// Errors raised while reading the manifest.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ManifestError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the TOML cannot be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a table has an unexpected shape.
    #[error("invalid manifest in {path}: {message}")]
    InvalidStructure {
        /// Path that had invalid content.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Template parameters and per-host extras.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunManifest {
    /// Template parameters keyed by name.
    pub parameters: BTreeMap<String, String>,
    /// Local files copied to every host after the restore.
    pub uploads: Vec<Utf8PathBuf>,
    /// Commands run on every host after the uploads.
    pub commands: Vec<String>,
    /// File the manifest was read from, if one exists.
    pub source: Option<Utf8PathBuf>,
}

impl RunManifest {
    /// Returns `true` when there is per-host work beyond the restore.
    #[must_use]
    pub fn has_extras(&self) -> bool {
        !self.uploads.is_empty() || !self.commands.is_empty()
    }
}

/// Locates and parses the manifest using `OrthoConfig`'s discovery order.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    discovery: ConfigDiscovery,
}

impl ManifestStore {
    /// Builds a store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    /// Reads the first existing candidate. No file means an empty manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] when the file cannot be read or its tables
    /// have the wrong shape.
    pub fn load(&self) -> Result<RunManifest, ManifestError> {
        for candidate in self.discovery.utf8_candidates() {
            if path_exists(&candidate)? {
                let contents = read_manifest(&candidate)?;
                return parse_manifest(&candidate, &contents);
            }
        }
        Ok(RunManifest::default())
    }
}

impl Default for ManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), ManifestError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| ManifestError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("manifest path is missing a filename"),
        })?;
    Ok((parent, file_name))
}

fn path_exists(path: &Utf8Path) -> Result<bool, ManifestError> {
    let (parent, file_name) = split_path(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| ManifestError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ManifestError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn read_manifest(path: &Utf8Path) -> Result<String, ManifestError> {
    let (parent, file_name) = split_path(path)?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ManifestError::Io {
            path: parent.to_path_buf(),
            message: err.to_string(),
        })?;

    dir.read_to_string(file_name)
        .map_err(|err| ManifestError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

/// Parses manifest tables out of `contents`; other keys are ignored.
///
/// # Errors
///
/// Returns [`ManifestError::Parse`] for malformed TOML (including duplicate
/// parameter names) and [`ManifestError::InvalidStructure`] when a table or
/// list has the wrong shape.
pub fn parse_manifest(path: &Utf8Path, contents: &str) -> Result<RunManifest, ManifestError> {
    let value: toml::Value = toml::from_str(contents).map_err(|err| ManifestError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let root = value
        .as_table()
        .ok_or_else(|| invalid(path, String::from("manifest root is not a table")))?;

    let parameters = match section(path, root, PARAMETERS_SECTION)? {
        Some(table) => read_parameters(path, table)?,
        None => BTreeMap::new(),
    };
    let (uploads, commands) = match section(path, root, EXTRAS_SECTION)? {
        Some(table) => (
            string_list(path, table, "uploads")?
                .into_iter()
                .map(Utf8PathBuf::from)
                .collect(),
            string_list(path, table, "commands")?,
        ),
        None => (Vec::new(), Vec::new()),
    };

    Ok(RunManifest {
        parameters,
        uploads,
        commands,
        source: Some(path.to_path_buf()),
    })
}

fn invalid(path: &Utf8Path, message: String) -> ManifestError {
    ManifestError::InvalidStructure {
        path: path.to_path_buf(),
        message,
    }
}

fn section<'t>(
    path: &Utf8Path,
    root: &'t toml::value::Table,
    name: &str,
) -> Result<Option<&'t toml::value::Table>, ManifestError> {
    root.get(name).map_or(Ok(None), |raw| {
        raw.as_table()
            .map(Some)
            .ok_or_else(|| invalid(path, format!("[{name}] must be a table")))
    })
}

fn read_parameters(
    path: &Utf8Path,
    table: &toml::value::Table,
) -> Result<BTreeMap<String, String>, ManifestError> {
    table
        .iter()
        .map(|(key, raw)| {
            let value = match raw {
                toml::Value::String(text) => text.clone(),
                toml::Value::Integer(number) => number.to_string(),
                toml::Value::Boolean(flag) => flag.to_string(),
                _ => {
                    return Err(invalid(
                        path,
                        format!("{PARAMETERS_SECTION}.{key} must be a string, integer or boolean"),
                    ));
                }
            };
            Ok((key.clone(), value))
        })
        .collect()
}

fn string_list(
    path: &Utf8Path,
    table: &toml::value::Table,
    key: &str,
) -> Result<Vec<String>, ManifestError> {
    let Some(raw) = table.get(key) else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| invalid(path, format!("{EXTRAS_SECTION}.{key} must be a list")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| invalid(path, format!("{EXTRAS_SECTION}.{key} must contain strings")))
        })
        .collect()
}
