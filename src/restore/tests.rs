//! Tests for the restore phase sequence.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::session::SessionConfig;
use crate::test_support::ScriptedRunner;

#[fixture]
fn config() -> SessionConfig {
    SessionConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        ssh_user: String::from("ec2-user"),
        ssh_port: 22,
        ssh_identity_file: None,
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        control_persist_secs: 300,
        relay_host: None,
        relay_user: None,
        relay_port: 22,
    }
}

fn factory(config: SessionConfig, runner: &ScriptedRunner) -> SessionFactory<ScriptedRunner> {
    SessionFactory::new(config, runner.clone())
        .unwrap_or_else(|err| panic!("config should validate: {err}"))
}

fn hosts(count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("h{n}")).collect()
}

fn plan(target_hosts: Vec<String>) -> RestorePlan {
    RestorePlan::new(
        DatastoreTarget {
            endpoint: String::from("db.example"),
            password: String::from("s3cret"),
        },
        BackupArtifacts {
            bucket: String::from("backups"),
            datastore_dump: String::from("jira/db.dump"),
            artifact_bundle: String::from("jira/indexes.tar.gz"),
        },
        BackupCredentials {
            credentials_file: Utf8PathBuf::from("/creds/credentials"),
            config_file: Utf8PathBuf::from("/creds/config"),
        },
        target_hosts,
    )
}

fn sequencer(sessions: &SessionFactory<ScriptedRunner>) -> RestoreSequencer<'_, ScriptedRunner> {
    RestoreSequencer::new(sessions, ServiceLayout::default(), Duration::from_secs(30))
}

fn first_index(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {needle}"))
}

fn last_index(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .rposition(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("no command containing {needle}"))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn phases_run_in_order_across_the_fleet(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);

    let report = sequencer(&sessions)
        .execute(&mut plan(hosts(2)))
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert_eq!(
        report.phases,
        vec![
            RestorePhase::Stopping,
            RestorePhase::CredentialStaging,
            RestorePhase::DatastoreRestore,
            RestorePhase::ArtifactRestore,
            RestorePhase::Starting,
            RestorePhase::Verifying,
        ]
    );
    assert_eq!(report.datastore_host.as_deref(), Some("h1"));
    assert!(!report.database_recreated);

    let lines = runner.command_lines();
    assert!(last_index(&lines, "shutdown.sh") < first_index(&lines, ":.aws/"));
    assert!(last_index(&lines, ":.aws/") < first_index(&lines, "createdb"));
    assert!(last_index(&lines, "pg_restore") < first_index(&lines, "tar -xzf"));
    assert!(last_index(&lines, "tar -xzf") < first_index(&lines, "startup.sh"));
    assert!(last_index(&lines, "catalina.pid") < first_index(&lines, "curl"));
    assert_eq!(runner.count_containing(":.aws/"), 4);
    assert_eq!(runner.count_containing("tar -xzf"), 2);
    assert_eq!(runner.count_containing("curl"), 2);
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(5)]
#[tokio::test(start_paused = true)]
async fn datastore_is_restored_exactly_once(config: SessionConfig, #[case] fleet_size: usize) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);

    sequencer(&sessions)
        .execute(&mut plan(hosts(fleet_size)))
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert_eq!(runner.count_containing("pg_restore"), 1);
    assert_eq!(runner.count_containing("createdb"), 1);
    assert_eq!(runner.count_containing("s3://backups/jira/db.dump"), 1);
    assert_eq!(runner.count_containing("s3://backups/jira/indexes.tar.gz"), fleet_size);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stop_failure_blocks_every_later_phase(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_once("shutdown.sh", 1, "");
    let sessions = factory(config, &runner);

    let err = sequencer(&sessions)
        .execute(&mut plan(hosts(3)))
        .await
        .expect_err("stop failure must abort");

    assert_eq!(
        err,
        RestoreError::CommandFailed {
            host: String::from("h1"),
            step: RestoreStep::StopService,
            code: 1,
        }
    );
    for needle in ["createdb", "pg_restore", "tar -xzf", "startup.sh", ":.aws/"] {
        assert_eq!(runner.count_containing(needle), 0, "{needle} must not run");
    }
}

#[rstest]
#[tokio::test]
async fn datastore_restore_skips_unreachable_hosts(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_once("ec2-user@h1 true", 255, "ssh: connect to host h1 port 22: Connection timed out");
    let sessions = factory(config, &runner);
    let mut plan = plan(hosts(2));

    let (host, recreated) = sequencer(&sessions)
        .restore_datastore(&mut plan)
        .unwrap_or_else(|err| panic!("datastore restore should succeed: {err}"));

    assert_eq!(host.as_deref(), Some("h2"));
    assert!(!recreated);
    assert!(plan.datastore_restored());
    let lines = runner.command_lines();
    assert_eq!(runner.count_containing("pg_restore"), 1);
    assert!(lines[first_index(&lines, "pg_restore")].contains("ec2-user@h2"));
}

#[rstest]
#[tokio::test]
async fn datastore_restore_is_latched(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);
    let restore = sequencer(&sessions);
    let mut plan = plan(hosts(2));

    let hosts_used: Vec<_> = (0..2)
        .map(|_| {
            restore
                .restore_datastore(&mut plan)
                .unwrap_or_else(|err| panic!("datastore restore should succeed: {err}"))
                .0
        })
        .collect();

    assert_eq!(hosts_used, vec![Some(String::from("h1")), None]);
    assert_eq!(runner.count_containing("pg_restore"), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn re_executing_a_plan_leaves_the_datastore_alone(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);
    let restore = sequencer(&sessions);
    let mut plan = plan(hosts(2));

    let first = restore
        .execute(&mut plan)
        .await
        .unwrap_or_else(|err| panic!("first restore should succeed: {err}"));
    let second = restore
        .execute(&mut plan)
        .await
        .unwrap_or_else(|err| panic!("second restore should succeed: {err}"));

    assert_eq!(first.datastore_host.as_deref(), Some("h1"));
    assert_eq!(second.datastore_host, None);
    assert!(!second.database_recreated);
    assert_eq!(runner.count_containing("pg_restore"), 1);
    assert_eq!(runner.count_containing("createdb"), 1);
    assert_eq!(runner.count_containing("tar -xzf"), 4);
    assert_eq!(runner.count_containing("curl"), 4);
}

#[rstest]
#[tokio::test]
async fn datastore_restore_needs_a_reachable_host(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_always("ec2-user@h1 true", 255);
    runner.respond_always("ec2-user@h2 true", 255);
    let sessions = factory(config, &runner);
    let mut plan = plan(hosts(2));

    let err = sequencer(&sessions)
        .restore_datastore(&mut plan)
        .expect_err("no host is reachable");

    assert_eq!(
        err,
        RestoreError::NoReachableHost {
            step: RestoreStep::RestoreDatabase
        }
    );
    assert!(!plan.datastore_restored());
    assert_eq!(runner.count_containing("pg_restore"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn existing_database_is_recreated(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_once("createdb", 1, "createdb: error: database \"jira\" already exists");
    let sessions = factory(config, &runner);

    let report = sequencer(&sessions)
        .execute(&mut plan(hosts(1)))
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert!(report.database_recreated);
    let lines = runner.command_lines();
    assert!(first_index(&lines, "pg_terminate_backend") < first_index(&lines, "dropdb"));
    assert!(first_index(&lines, "dropdb") < last_index(&lines, "createdb"));
    assert!(last_index(&lines, "createdb") < first_index(&lines, "pg_restore"));
    assert_eq!(runner.count_containing("createdb"), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn start_is_retried_once(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_once("catalina.pid", 1, "");
    let sessions = factory(config, &runner);

    sequencer(&sessions)
        .execute(&mut plan(hosts(2)))
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert_eq!(runner.count_containing("startup.sh"), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn start_fails_after_the_retry(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_always("catalina.pid", 1);
    let sessions = factory(config, &runner);

    let err = sequencer(&sessions)
        .execute(&mut plan(hosts(2)))
        .await
        .expect_err("start must fail");

    assert_eq!(err.host(), Some("h1"));
    assert_eq!(err.step(), Some(RestoreStep::StartService));
    assert_eq!(runner.count_containing("catalina.pid"), 2);
    assert_eq!(runner.count_containing("curl"), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn verification_waits_for_the_service(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_once("curl", 7, "Connection refused");
    runner.respond_once("curl", 22, "The requested URL returned error: 503");
    let sessions = factory(config, &runner);

    sequencer(&sessions)
        .execute(&mut plan(hosts(1)))
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert_eq!(runner.count_containing("curl"), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn verification_times_out(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    runner.respond_always("curl", 7);
    let sessions = factory(config, &runner);

    let err = sequencer(&sessions)
        .with_verify_interval(Duration::from_secs(10))
        .execute(&mut plan(hosts(2)))
        .await
        .expect_err("verification must time out");

    let RestoreError::Timeout {
        host,
        step,
        elapsed,
        ceiling,
    } = err
    else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(host, "h1");
    assert_eq!(step, RestoreStep::VerifyService);
    assert_eq!(ceiling, Duration::from_secs(30));
    assert!(elapsed >= ceiling && elapsed < Duration::from_secs(40));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn setenv_is_installed_on_every_host(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);
    let mut plan = plan(hosts(2)).with_setenv_file(Some(Utf8PathBuf::from("/conf/setenv.sh")));

    sequencer(&sessions)
        .execute(&mut plan)
        .await
        .unwrap_or_else(|err| panic!("restore should succeed: {err}"));

    assert_eq!(runner.count_containing("/conf/setenv.sh ec2-user@"), 2);
    assert_eq!(runner.count_containing("/opt/atlassian/jira/bin/setenv.sh"), 2);
}

#[rstest]
#[tokio::test]
async fn empty_plan_is_rejected(config: SessionConfig) {
    let runner = ScriptedRunner::succeeding();
    let sessions = factory(config, &runner);

    let err = sequencer(&sessions)
        .execute(&mut plan(Vec::new()))
        .await
        .expect_err("empty plan");

    assert_eq!(err, RestoreError::EmptyPlan);
    assert!(runner.invocations().is_empty());
}

#[test]
fn password_is_masked_in_logged_commands() {
    let target = DatastoreTarget {
        endpoint: String::from("db.example"),
        password: String::from("p@ss word"),
    };
    let command = target.restore_dump(&ServiceLayout::default(), "db.dump");

    assert!(command.as_str().contains("PGPASSWORD='p@ss word'"));
    assert!(!command.to_string().contains("p@ss word"));
    assert!(command.to_string().contains("******"));
}

#[rstest]
#[case::plain("jira", r"WHERE datname = '\''jira'\'' AND pid", "--if-exists jira")]
#[case::quote_and_space(
    "o'brien db",
    r"WHERE datname = '\''o'\'''\''brien db'\'' AND pid",
    r"--if-exists 'o'\''brien db'"
)]
fn terminate_query_quotes_for_sql_then_shell(
    #[case] database_name: &str,
    #[case] terminate_filter: &str,
    #[case] drop_target: &str,
) {
    let target = DatastoreTarget {
        endpoint: String::from("db.example"),
        password: String::from("secret"),
    };
    let layout = ServiceLayout {
        database_name: database_name.to_owned(),
        ..ServiceLayout::default()
    };

    let commands = target.recreate_database(&layout);
    let lines: Vec<&str> = commands.iter().map(RemoteCommand::as_str).collect();

    assert!(
        lines.first().is_some_and(|terminate| terminate
            .contains(r"postgres -c 'SELECT pg_terminate_backend(pid)")
            && terminate.contains(terminate_filter)
            && terminate.ends_with(r"pg_backend_pid();'")),
        "terminate command: {lines:?}"
    );
    assert!(
        lines.get(1).is_some_and(|dropdb| dropdb.ends_with(drop_target)),
        "dropdb command: {lines:?}"
    );
}
