use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

fn valid_config_json() -> &'static str {
    r#"
{
  "name": "bedroom",
  "network": { "command_port": 0, "http_port": 0 },
  "sounds": [
    { "name": "birds", "type": "file", "source": "/music/birds.mp3" },
    { "name": "news", "type": "radio", "source": "http://radio.example/stream" },
    { "name": "morning", "type": "playlist", "source": "news,birds" }
  ],
  "lights": [
    { "id": 1, "name": "ceiling", "type": "pca9685" }
  ]
}
"#
}

fn valid_alarm_json() -> &'static str {
    r#"
{
  "version": 1,
  "alarms": [
    { "id": 1, "time": "07:00:00", "week_days": ["MONDAY", "FRIDAY"], "sound_id": 2 },
    { "id": 2, "one_time_only": true, "time": "09:30:00" }
  ]
}
"#
}

fn write(path: &Path, content: &str) {
    fs::write(path, content).expect("write fixture");
}

#[test]
fn check_prints_configuration_and_alarm_count() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    let alarms = dir.path().join("alarms.json");
    write(&config, valid_config_json());
    write(&alarms, valid_alarm_json());

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(config)
        .arg("--alarms")
        .arg(alarms)
        .assert()
        .success()
        .stdout(predicate::str::contains("name: bedroom"))
        .stdout(predicate::str::contains("morning PLAYLIST [news, birds]"))
        .stdout(predicate::str::contains("1: ceiling (pca9685)"))
        .stdout(predicate::str::contains("stored alarms: 2"));
}

#[test]
fn missing_alarm_file_starts_empty() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    write(&config, valid_config_json());

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(config)
        .arg("--alarms")
        .arg(dir.path().join("missing.json"))
        .assert()
        .success()
        .stdout(predicate::str::contains("stored alarms: 0"));
}

#[test]
fn corrupt_alarm_file_is_not_fatal() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    let alarms = dir.path().join("alarms.json");
    write(&config, valid_config_json());
    write(&alarms, "{ not-valid-json ");

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(config)
        .arg("--alarms")
        .arg(alarms)
        .assert()
        .success()
        .stdout(predicate::str::contains("stored alarms: 0"))
        .stderr(predicate::str::contains("unable to load stored alarms"));
}

#[test]
fn malformed_config_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    write(&config, "{ not-valid-json ");

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn missing_config_is_fatal() {
    let dir = tempdir().expect("tempdir");

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("unable to read configuration"));
}

#[test]
fn unknown_log_level_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    write(&config, valid_config_json());

    let mut cmd = cargo_bin_cmd!("wakeclock");
    cmd.arg("--check")
        .arg("--config")
        .arg(config)
        .arg("--log-level")
        .arg("chatty")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log level"));
}

#[cfg(unix)]
#[test]
fn sigterm_switches_everything_off_before_exit() {
    use std::io::{BufRead, BufReader, Read};
    use std::process::{Command, Stdio};

    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("wakeclock.json");
    write(&config, valid_config_json());

    let mut child = Command::new(env!("CARGO_BIN_EXE_wakeclock"))
        .arg("--config")
        .arg(&config)
        .arg("--alarms")
        .arg(dir.path().join("alarms.json"))
        .arg("--poll-ms")
        .arg("20")
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn daemon");
    let mut stderr = BufReader::new(child.stderr.take().expect("stderr"));

    let mut startup = String::new();
    while !startup.contains("running with") {
        let read = stderr.read_line(&mut startup).expect("read stderr");
        assert!(read > 0, "daemon exited early:\n{startup}");
    }

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(child.id().to_string())
        .status()
        .expect("send SIGTERM");
    assert!(status.success());

    let mut rest = String::new();
    stderr.read_to_string(&mut rest).expect("read stderr");
    let exit = child.wait().expect("wait for daemon");
    assert!(exit.success(), "daemon failed:\n{startup}{rest}");
    assert!(rest.contains("SIGTERM received"), "{rest}");
    assert!(rest.contains("switching everything off"), "{rest}");
    assert!(rest.contains("controller stopped"), "{rest}");
}
