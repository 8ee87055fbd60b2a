//! Files persisted for downstream consumers once a rollout completes.
//!
//! Three files are produced: an export file of `KEY="value"` lines built from
//! the stack outputs, a newline-delimited host list and a single-line file
//! holding the resolved base URL.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{error, info};

use crate::provider::StackOutput;

/// Errors raised while writing persisted state.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExportError {
    /// The destination has no file name component.
    #[error("export path {path} is missing a file name")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// File system access failed.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Path being written.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Chooses the outputs to export.
///
/// With no keys selected every output is exported and the omission is
/// reported at error level, since downstream consumers usually expect a
/// curated set.
#[must_use]
pub fn select_outputs<'o>(outputs: &'o [StackOutput], keys: &[String]) -> Vec<&'o StackOutput> {
    if keys.is_empty() {
        error!("No export keys were defined; exporting every stack output");
        return outputs.iter().collect();
    }
    outputs
        .iter()
        .filter(|output| keys.iter().any(|key| *key == output.key))
        .collect()
}

/// Renders outputs as `KEY="value"` lines.
#[must_use]
pub fn render_outputs(outputs: &[&StackOutput]) -> String {
    outputs.iter().fold(String::new(), |mut rendered, output| {
        let value = output.value.replace('\\', "\\\\").replace('"', "\\\"");
        rendered.push_str(&format!("{}=\"{value}\"\n", output.key));
        rendered
    })
}

/// Writes the selected stack outputs to `path`.
///
/// # Errors
///
/// Returns [`ExportError`] when the file cannot be written.
pub fn write_outputs(
    path: &Utf8Path,
    outputs: &[StackOutput],
    keys: &[String],
) -> Result<(), ExportError> {
    let selected = select_outputs(outputs, keys);
    info!(path = %path, exported = selected.len(), "Writing stack outputs");
    write_file(path, &render_outputs(&selected))
}

/// Writes one host per line to `path`.
///
/// # Errors
///
/// Returns [`ExportError`] when the file cannot be written.
pub fn write_hosts(path: &Utf8Path, hosts: &[String]) -> Result<(), ExportError> {
    info!(path = %path, hosts = hosts.len(), "Writing host list");
    let contents = hosts.iter().fold(String::new(), |mut rendered, host| {
        rendered.push_str(host);
        rendered.push('\n');
        rendered
    });
    write_file(path, &contents)
}

/// Writes `base_url` to `path` with no trailing newline.
///
/// # Errors
///
/// Returns [`ExportError`] when the file cannot be written.
pub fn write_base_url(path: &Utf8Path, base_url: &str) -> Result<(), ExportError> {
    info!(path = %path, base_url, "Writing base URL");
    write_file(path, base_url)
}

fn write_file(path: &Utf8Path, contents: &str) -> Result<(), ExportError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| ExportError::InvalidPath {
        path: path.to_path_buf(),
    })?;

    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| ExportError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| ExportError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;

    dir.write(file_name, contents).map_err(|err| ExportError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
