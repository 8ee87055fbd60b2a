//! Remote command text with secret redaction for logging.

use std::fmt;

const REDACTED: &str = "******";

/// A shell command destined for a remote host.
///
/// Any registered secret is masked when the command is displayed, so the
/// command can be logged verbatim while the real text is sent over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    text: String,
    secrets: Vec<String>,
}

impl RemoteCommand {
    /// Wraps a command line.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            secrets: Vec::new(),
        }
    }

    /// Marks `secret` for redaction. Empty secrets are ignored.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let value = secret.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    /// Returns the command exactly as it is executed.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the command with every secret masked.
    #[must_use]
    pub fn redacted(&self) -> String {
        self.secrets
            .iter()
            .fold(self.text.clone(), |text, secret| text.replace(secret, REDACTED))
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl From<String> for RemoteCommand {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for RemoteCommand {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<&RemoteCommand> for RemoteCommand {
    fn from(command: &RemoteCommand) -> Self {
        command.clone()
    }
}
