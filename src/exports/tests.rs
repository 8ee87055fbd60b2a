//! Tests for persisted rollout state.

use std::fs;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;

#[fixture]
fn outputs() -> Vec<StackOutput> {
    vec![
        StackOutput {
            key: String::from("JIRAURL"),
            value: String::from("http://lb.example"),
        },
        StackOutput {
            key: String::from("DBEndpointAddress"),
            value: String::from("db.example"),
        },
        StackOutput {
            key: String::from("Note"),
            value: String::from("say \"hi\""),
        },
    ]
}

fn temp_path(tmp: &TempDir, name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(tmp.path().join(name))
        .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
}

fn read(path: &Utf8Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

#[rstest]
fn selected_keys_filter_the_export_file(outputs: Vec<StackOutput>) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = temp_path(&tmp, "cloudformation.conf");

    write_outputs(&path, &outputs, &[String::from("JIRAURL")])
        .unwrap_or_else(|err| panic!("write outputs: {err}"));

    assert_eq!(read(&path), "JIRAURL=\"http://lb.example\"\n");
}

#[rstest]
fn no_selection_exports_everything(outputs: Vec<StackOutput>) {
    let selected = select_outputs(&outputs, &[]);

    assert_eq!(
        render_outputs(&selected),
        "JIRAURL=\"http://lb.example\"\nDBEndpointAddress=\"db.example\"\nNote=\"say \\\"hi\\\"\"\n"
    );
}

#[rstest]
fn unknown_keys_select_nothing(outputs: Vec<StackOutput>) {
    assert!(select_outputs(&outputs, &[String::from("Missing")]).is_empty());
}

#[test]
fn host_list_has_one_host_per_line() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = temp_path(&tmp, "nested/ec2_nodes");

    write_hosts(&path, &[String::from("h1.example"), String::from("h2.example")])
        .unwrap_or_else(|err| panic!("write hosts: {err}"));

    assert_eq!(read(&path), "h1.example\nh2.example\n");
}

#[test]
fn base_url_file_holds_a_single_line() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = temp_path(&tmp, "baseurl");

    write_base_url(&path, "lb.example").unwrap_or_else(|err| panic!("write base url: {err}"));
    write_base_url(&path, "lb2.example").unwrap_or_else(|err| panic!("rewrite base url: {err}"));

    assert_eq!(read(&path), "lb2.example");
}

#[test]
fn path_without_file_name_is_rejected() {
    let err = write_base_url(Utf8Path::new("/"), "lb.example").expect_err("root has no file name");

    assert!(matches!(err, ExportError::InvalidPath { .. }), "{err}");
}
