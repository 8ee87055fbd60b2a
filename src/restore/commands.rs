//! Shell commands run on application hosts during a restore.
//!
//! Every interpolated value is shell-escaped. Commands that carry the
//! datastore password register it as a secret so logs show it masked.

use std::borrow::Cow;

use shell_escape::unix::escape;

use crate::session::RemoteCommand;

/// Remote directory receiving the backup-store credentials.
pub const CREDENTIALS_DIR: &str = ".aws";

/// Where the application and its data live on every host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceLayout {
    /// Installation directory holding `bin/startup.sh` and `bin/shutdown.sh`.
    pub install_dir: String,
    /// Index directory the artifact bundle is unpacked into.
    pub index_dir: String,
    /// Account that owns the service files.
    pub service_user: String,
    /// Local HTTP port probed to verify the service.
    pub http_port: u16,
    /// Database name restored from the dump.
    pub database_name: String,
    /// Database administrator account.
    pub database_user: String,
    /// Database port.
    pub database_port: u16,
}

impl Default for ServiceLayout {
    fn default() -> Self {
        Self {
            install_dir: String::from("/opt/atlassian/jira"),
            index_dir: String::from("/var/atlassian/application-data/jira/caches/indexes"),
            service_user: String::from("jira"),
            http_port: 8080,
            database_name: String::from("jira"),
            database_user: String::from("postgres"),
            database_port: 5432,
        }
    }
}

fn quoted(value: &str) -> Cow<'_, str> {
    escape(value.into())
}

/// Renders `value` as a SQL string literal. Shell escaping still applies on
/// top of it.
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// File name an object lands under after `aws s3 cp` into the working
/// directory.
#[must_use]
pub fn object_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Downloads `s3://bucket/key` into the login directory.
#[must_use]
pub fn fetch_object(bucket: &str, key: &str) -> RemoteCommand {
    let url = format!("s3://{bucket}/{key}");
    RemoteCommand::new(format!("aws s3 cp {} .", quoted(&url)))
}

/// Stops the service and waits until no service process remains.
#[must_use]
pub fn stop_service(layout: &ServiceLayout) -> Vec<RemoteCommand> {
    let shutdown = format!(
        "(sudo {}/bin/shutdown.sh > /dev/null 2>&1 || true)",
        quoted(&layout.install_dir)
    );
    vec![
        RemoteCommand::new(shutdown.clone()),
        RemoteCommand::new(format!(
            "while pgrep -u root java > /dev/null; do echo 'Waiting for service to shut down...'; \
             sleep 10; {shutdown}; done; echo 'Service is down.'"
        )),
    ]
}

/// Starts the service and checks its recorded process is alive.
#[must_use]
pub fn start_service(layout: &ServiceLayout) -> Vec<RemoteCommand> {
    let install_dir = quoted(&layout.install_dir);
    vec![
        RemoteCommand::new(format!(
            "sudo su -c \"exec env USE_NOHUP=true {install_dir}/bin/startup.sh > /dev/null\"; sleep 10"
        )),
        RemoteCommand::new(format!(
            "ps cax | grep $(sudo cat {install_dir}/work/catalina.pid) || \
             (echo 'No live service process found' && exit 1)"
        )),
    ]
}

/// Creates the remote credentials directory.
#[must_use]
pub fn prepare_credentials_dir() -> RemoteCommand {
    RemoteCommand::new(format!("mkdir -p {CREDENTIALS_DIR}"))
}

/// Connection details for the shared datastore.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatastoreTarget {
    /// Database host name.
    pub endpoint: String,
    /// Administrator password.
    pub password: String,
}

impl DatastoreTarget {
    fn command(&self, body: &str) -> RemoteCommand {
        let escaped = quoted(&self.password).into_owned();
        RemoteCommand::new(format!("PGPASSWORD={escaped} {body}"))
            .with_secret(escaped)
            .with_secret(self.password.clone())
    }

    fn connection(&self, layout: &ServiceLayout) -> String {
        format!(
            "-h {} -p {} -U {}",
            quoted(&self.endpoint),
            layout.database_port,
            quoted(&layout.database_user)
        )
    }

    /// Creates the application database. Fails when it already exists.
    #[must_use]
    pub fn create_database(&self, layout: &ServiceLayout) -> RemoteCommand {
        self.command(&format!(
            "createdb {} {}",
            self.connection(layout),
            quoted(&layout.database_name)
        ))
    }

    /// Terminates other sessions, drops the database and creates it again.
    #[must_use]
    pub fn recreate_database(&self, layout: &ServiceLayout) -> Vec<RemoteCommand> {
        let connection = self.connection(layout);
        let database = quoted(&layout.database_name);
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {} AND pid <> pg_backend_pid();",
            sql_literal(&layout.database_name)
        );
        vec![
            self.command(&format!("psql {connection} postgres -c {}", quoted(&terminate))),
            self.command(&format!("dropdb {connection} --if-exists {database}")),
            self.create_database(layout),
        ]
    }

    /// Restores the `public` schema from a dump in the login directory.
    #[must_use]
    pub fn restore_dump(&self, layout: &ServiceLayout, dump_file: &str) -> RemoteCommand {
        self.command(&format!(
            "pg_restore -n public {} -d {} {}",
            self.connection(layout),
            quoted(&layout.database_name),
            quoted(dump_file)
        ))
    }
}

/// Fetches the artifact bundle, unpacks it into the index directory and
/// hands ownership to the service account.
#[must_use]
pub fn restore_artifacts(layout: &ServiceLayout, bucket: &str, bundle_key: &str) -> Vec<RemoteCommand> {
    let index_dir = quoted(&layout.index_dir);
    vec![
        fetch_object(bucket, bundle_key),
        RemoteCommand::new(format!(
            "sudo mkdir -p {index_dir} && sudo tar -xzf {} -C {index_dir}",
            quoted(object_file_name(bundle_key))
        )),
        RemoteCommand::new(format!(
            "sudo chown -R {} {index_dir}",
            quoted(&layout.service_user)
        )),
    ]
}

/// Installs an uploaded `setenv.sh` into the service's `bin` directory.
#[must_use]
pub fn install_setenv(layout: &ServiceLayout, uploaded_file: &str) -> RemoteCommand {
    let target = format!("{}/bin/setenv.sh", layout.install_dir);
    RemoteCommand::new(format!(
        "sudo cp {} {target} && sudo chown {} {target}",
        quoted(uploaded_file),
        quoted(&layout.service_user),
        target = quoted(&target)
    ))
}

/// Probes the service over local HTTP; exits non-zero until it answers.
#[must_use]
pub fn probe_service(layout: &ServiceLayout) -> RemoteCommand {
    RemoteCommand::new(format!(
        "curl -sS --fail --connect-timeout 5 --max-time 5 -o /dev/null localhost:{}",
        layout.http_port
    ))
}
