//! Runs the `orglist` binary against a temp file.

use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn orglist(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_orglist"))
        .current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env_remove("ORGLIST_LIST")
        .env_remove("RUST_LOG")
        .arg("--file")
        .arg(dir.join("todo.org"))
        .args(args)
        .output()
        .expect("run orglist")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "orglist failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).expect("utf8 stdout")
}

#[test]
fn add_toggle_and_list_items() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path();

    stdout(&orglist(dir, &["--list", "Home", "add", "Paint"]));
    stdout(&orglist(dir, &["--list", "Home", "add", "Sweep"]));
    let out = stdout(&orglist(dir, &["--list", "Home", "toggle", "--item", "Paint"]));
    assert!(out.ends_with(":2: Home / Paint\n"), "{out}");

    assert_eq!(
        fs::read_to_string(dir.join("todo.org")).unwrap(),
        "* Home\n** DONE Paint\n** TODO Sweep\n"
    );
    let items = stdout(&orglist(dir, &["--list", "Home", "items"]));
    assert_eq!(items, "DONE   Paint\nTODO   Sweep\n");
}

#[test]
fn json_listing_and_prompted_selection() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path();
    fs::write(dir.join("todo.org"), "* Home :house:\n* Work\n").unwrap();

    let lists = stdout(&orglist(dir, &["--json", "lists"]));
    let parsed: serde_json::Value = serde_json::from_str(&lists).unwrap();
    assert_eq!(parsed[0]["name"], "Home");
    assert_eq!(parsed[0]["tags"][0], "house");
    assert_eq!(parsed[1]["offset"], 15);

    let mut child = Command::new(env!("CARGO_BIN_EXE_orglist"))
        .current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env_remove("ORGLIST_LIST")
        .arg("--file")
        .arg(dir.join("todo.org"))
        .arg("select")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .expect("spawn orglist");
    {
        use std::io::Write;
        let stdin = child.stdin.as_mut().expect("stdin");
        stdin.write_all(b"2\n").unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert_eq!(stdout(&output), "Work\n");
}

#[test]
fn bad_arguments_fail_without_touching_the_file() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path();
    fs::write(dir.join("todo.org"), "* Home\n** TODO Paint\n").unwrap();

    let out = orglist(dir, &["--list", "Home", "priority", "Q", "--item", "Paint"]);
    assert!(!out.status.success());
    let out = orglist(dir, &["--list", "Home", "effort", "soon", "--item", "Paint"]);
    assert!(!out.status.success());
    assert_eq!(
        fs::read_to_string(dir.join("todo.org")).unwrap(),
        "* Home\n** TODO Paint\n"
    );
}

#[test]
fn items_of_an_unknown_list_fail_and_leave_the_file_alone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path();
    fs::write(dir.join("todo.org"), "* Home\n").unwrap();

    let out = orglist(dir, &["--list", "NoSuchList", "items"]);
    assert!(!out.status.success());
    assert!(
        String::from_utf8_lossy(&out.stderr).contains("NoSuchList"),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert_eq!(fs::read_to_string(dir.join("todo.org")).unwrap(), "* Home\n");
}
