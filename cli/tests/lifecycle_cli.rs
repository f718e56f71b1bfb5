#![cfg(unix)]

use std::os::unix::process::CommandExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const CONFIG: &str = r#"
shell = "/bin/sh"
shell_args = ["-c"]
stop_grace_period_ms = 200
"#;

fn home_with_catalog(catalog: &str) -> Result<TempDir, Box<dyn std::error::Error>> {
    let home = TempDir::new()?;
    std::fs::write(home.path().join("config.toml"), CONFIG)?;
    std::fs::write(home.path().join("scripts.json"), catalog)?;
    Ok(home)
}

fn scriptdeck(home: &Path) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("scriptdeck")?;
    cmd.env("SCRIPTDECK_HOME", home).env_remove("RUST_LOG");
    Ok(cmd)
}

#[test]
fn list_shows_every_script_as_idle() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(
        r#"[
            {"id": "build", "name": "Build", "command": "echo hi"},
            {"id": "deploy", "command": "echo deploy", "isEnabled": false}
        ]"#,
    )?;

    scriptdeck(home.path())?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("idle"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("[disabled]"));
    Ok(())
}

#[test]
fn run_prints_output_and_succeeds() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(r#"[{"id": "greet", "command": "echo hello; echo oops >&2"}]"#)?;

    scriptdeck(home.path())?
        .args(["run", "greet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("==> greet: success"))
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("oops"));

    let index = std::fs::read_to_string(home.path().join("run_index.json"))?;
    assert_eq!(index.trim(), "{}");
    Ok(())
}

#[test]
fn failing_script_fails_the_command() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(r#"[{"id": "broken", "command": "exit 3"}]"#)?;

    scriptdeck(home.path())?
        .args(["run", "broken"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("exited with code 3"));
    Ok(())
}

#[test]
fn run_all_skips_disabled_scripts() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(
        r#"[
            {"id": "one", "command": "echo first"},
            {"id": "two", "command": "echo second"},
            {"id": "off", "command": "echo never", "isEnabled": false}
        ]"#,
    )?;

    scriptdeck(home.path())?
        .arg("run-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("first"))
        .stdout(predicate::str::contains("second"))
        .stdout(predicate::str::contains("never").not());
    Ok(())
}

#[test]
fn unknown_script_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(r#"[{"id": "greet", "command": "echo hello"}]"#)?;

    scriptdeck(home.path())?
        .args(["run", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
    Ok(())
}

#[test]
fn stop_without_a_running_process_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(r#"[{"id": "greet", "command": "echo hello"}]"#)?;

    scriptdeck(home.path())?
        .args(["stop", "greet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("greet: idle"));
    Ok(())
}

#[test]
fn stop_terminates_a_process_left_by_an_earlier_session() -> Result<(), Box<dyn std::error::Error>>
{
    let home = home_with_catalog(r#"[{"id": "server", "command": "sleep 30"}]"#)?;
    let mut orphan = std::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()?;
    let pid = orphan.id();
    std::fs::write(
        home.path().join("run_index.json"),
        format!(
            r#"{{"server": {{"processIdentifier": {pid}, "startedAtEpochSeconds": 1700000000.5}}}}"#
        ),
    )?;

    scriptdeck(home.path())?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("pid {pid}")));

    scriptdeck(home.path())?
        .args(["stop", "server"])
        .assert()
        .success()
        .stdout(predicate::str::contains("server: stopped"));

    let status = orphan.wait()?;
    assert!(!status.success());
    let index = std::fs::read_to_string(home.path().join("run_index.json"))?;
    assert_eq!(index.trim(), "{}");
    Ok(())
}

#[test]
fn status_drops_entries_for_dead_processes() -> Result<(), Box<dyn std::error::Error>> {
    let home = home_with_catalog(r#"[{"id": "server", "command": "sleep 30"}]"#)?;
    let mut finished = std::process::Command::new("true").spawn()?;
    let pid = finished.id();
    finished.wait()?;
    std::fs::write(
        home.path().join("run_index.json"),
        format!(
            r#"{{"server": {{"processIdentifier": {pid}, "startedAtEpochSeconds": 1700000000.0}}}}"#
        ),
    )?;

    scriptdeck(home.path())?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing running"));
    Ok(())
}
