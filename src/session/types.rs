//! Plain data describing where and how a session connects.

use camino::Utf8PathBuf;

/// Host a session connects to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionTarget {
    /// DNS name or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
}

/// Login details for a target host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionCredentials {
    /// Remote login user.
    pub user: String,
    /// Optional private key path.
    pub identity_file: Option<String>,
}

/// Bastion used to tunnel into hosts without public addresses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayTarget {
    /// Login user on the bastion.
    pub user: String,
    /// Bastion DNS name or IP address.
    pub host: String,
    /// Bastion SSH port.
    pub port: u16,
}

impl RelayTarget {
    /// Renders the `ProxyJump` argument, `user@host:port`.
    #[must_use]
    pub fn jump_spec(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Local file copied into a remote directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileUpload {
    /// Local file path.
    pub source: Utf8PathBuf,
    /// Remote directory that receives the file under its own name.
    pub destination_dir: String,
}

impl FileUpload {
    /// Builds an upload of `source` into `destination_dir`.
    #[must_use]
    pub fn new(source: impl Into<Utf8PathBuf>, destination_dir: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination_dir: destination_dir.into(),
        }
    }
}
